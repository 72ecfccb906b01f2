// CNI protocol server: receives ADD/DEL/CHECK lifecycle events and
// orchestrates IPAM and interface configuration in the right order, with
// IP release on the failure path so address space never leaks.
//
// Every request runs on its own tonic task. Shared state is limited to the
// IPAM registry (read-mostly) and the result cache (per-key); concurrent
// ADD/DEL for the *same* pod interface is a runtime-level race the caller
// must serialize.

pub mod error;
pub mod interface_configuration;
pub mod ipam;
pub mod sriov;
pub mod types;


use crate::proto::cni_server::Cni;
use crate::proto::{CniCmdRequest, CniCmdResponse, Error as ProtoError, ErrorCode};
use crate::utils::validation::InputValidator;
use error::CniError;
use interface_configuration::{host_interface_name, InterfaceConfigurator};
use ipam::{result_key, IpamRegistry, PluginArgs};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use types::{
    AttachmentRequest, CniResult, Interface, IpamResult, K8sArgs, NetworkConfig,
    SUPPORTED_CNI_VERSIONS,
};

pub struct CniService {
    ipam: Arc<IpamRegistry>,
    configurator: Arc<InterfaceConfigurator>,
    bridge: Arc<crate::network::bridge::BridgeManager>,
}

impl CniService {
    pub fn new(
        ipam: Arc<IpamRegistry>,
        configurator: Arc<InterfaceConfigurator>,
        bridge: Arc<crate::network::bridge::BridgeManager>,
    ) -> Self {
        Self {
            ipam,
            configurator,
            bridge,
        }
    }

    /// Parse and validate the wire request into an immutable
    /// AttachmentRequest. `require_netns` is false for DEL, which may arrive
    /// after the runtime has already destroyed the namespace.
    fn parse_request(
        args: Option<crate::proto::CniCmdArgs>,
        require_netns: bool,
    ) -> Result<AttachmentRequest, CniError> {
        let args = args.ok_or_else(|| CniError::InvalidArgs("missing cni_args".to_string()))?;

        InputValidator::validate_container_id(&args.container_id)
            .map_err(CniError::InvalidArgs)?;
        InputValidator::validate_interface_name(&args.ifname).map_err(CniError::InvalidArgs)?;
        if require_netns {
            InputValidator::validate_netns_path(&args.netns).map_err(CniError::InvalidArgs)?;
        }

        let netconf: NetworkConfig = serde_json::from_slice(&args.network_configuration)
            .map_err(|e| CniError::InvalidConfig(e.to_string()))?;
        if !SUPPORTED_CNI_VERSIONS.contains(&netconf.cni_version.as_str()) {
            return Err(CniError::IncompatibleVersion(netconf.cni_version));
        }

        let k8s = K8sArgs::parse(&args.args);
        Ok(AttachmentRequest {
            container_id: args.container_id,
            netns: args.netns,
            ifname: args.ifname,
            args: args.args,
            path: args.path,
            netconf_bytes: args.network_configuration,
            netconf,
            k8s,
        })
    }

    fn plugin_args(req: &AttachmentRequest) -> PluginArgs {
        PluginArgs {
            container_id: req.container_id.clone(),
            netns: req.netns.clone(),
            ifname: req.ifname.clone(),
            args: req.args.clone(),
            path: req.path.clone(),
        }
    }

    // ── ADD ───────────────────────────────────────────────────────────

    pub async fn handle_add(&self, req: &AttachmentRequest) -> Result<Vec<u8>, CniError> {
        let ipam_type = req.netconf.ipam_type().to_string();
        if !self.ipam.is_type_registered(&ipam_type) {
            return Err(CniError::DriverNotFound);
        }

        let key = result_key(&req.container_id, &req.ifname);
        let plugin_args = Self::plugin_args(req);

        // IPAM first; a retried ADD gets the cached allocation back
        let ipam_result = self
            .ipam
            .exec_add(&ipam_type, &plugin_args, &req.k8s, &req.netconf_bytes, &key)
            .await?;

        let configured = match self.configurator.configure_interfaces(req, &ipam_result).await {
            Ok(configured) => configured,
            Err(e) => {
                // Interface configuration failed after the allocation
                // succeeded: release the IP before surfacing the error, or
                // the address leaks. Best-effort; the original error wins.
                self.release_ipam(&ipam_type, &plugin_args, req, &key).await;
                return Err(e);
            }
        };

        if let Err(e) = self.bridge.register_port(&configured.host).await {
            if let Err(remove_err) = self.configurator.remove_interfaces(req).await {
                tracing::warn!(
                    "Interface cleanup after failed port registration failed for {}: {}",
                    key,
                    remove_err
                );
            }
            self.release_ipam(&ipam_type, &plugin_args, req, &key).await;
            return Err(e.into());
        }

        tracing::info!(
            "ADD complete for {} (pod {}/{}, mode {:?}, port {})",
            key,
            req.k8s.pod_namespace,
            req.k8s.pod_name,
            configured.mode,
            configured.port_id
        );

        let result = Self::build_result(req, &ipam_result, &configured);
        serde_json::to_vec(&result)
            .map_err(|e| CniError::InvalidConfig(format!("failed to encode result: {}", e)))
    }

    async fn release_ipam(
        &self,
        ipam_type: &str,
        plugin_args: &PluginArgs,
        req: &AttachmentRequest,
        key: &str,
    ) {
        if let Err(release_err) = self
            .ipam
            .exec_del(ipam_type, plugin_args, &req.k8s, &req.netconf_bytes, key)
            .await
        {
            tracing::warn!("IPAM release for {} failed during rollback: {}", key, release_err);
        }
    }

    /// Assemble the response: container interface first, then the host end,
    /// with the allocation pointing at the container interface.
    fn build_result(
        req: &AttachmentRequest,
        ipam: &IpamResult,
        configured: &interface_configuration::ConfiguredInterface,
    ) -> CniResult {
        let mut interfaces = vec![Interface {
            name: req.ifname.clone(),
            mac: configured.container.as_ref().and_then(|c| c.mac.clone()),
            sandbox: Some(req.netns.clone()),
        }];
        interfaces.push(Interface {
            name: configured.host.name.clone(),
            mac: configured.host.mac.clone(),
            sandbox: None,
        });

        let mut ips = ipam.result.ips.clone();
        for ip in &mut ips {
            ip.interface = Some(0);
        }

        CniResult {
            cni_version: req.netconf.cni_version.clone(),
            interfaces,
            ips,
            routes: ipam.result.routes.clone(),
            dns: ipam.result.dns.clone(),
        }
    }

    // ── DEL ───────────────────────────────────────────────────────────

    pub async fn handle_del(&self, req: &AttachmentRequest) -> Result<(), CniError> {
        let ipam_type = req.netconf.ipam_type().to_string();
        let key = result_key(&req.container_id, &req.ifname);
        let plugin_args = Self::plugin_args(req);

        // Release the allocation first; a missing cache entry is success
        self.ipam
            .exec_del(&ipam_type, &plugin_args, &req.k8s, &req.netconf_bytes, &key)
            .await?;

        let host_name = host_interface_name(&req.container_id, &req.ifname);
        self.bridge.unregister_port(&host_name);

        // Deleting an already-absent interface is success: the desired end
        // state is reached either way
        self.configurator.remove_interfaces(req).await?;

        tracing::info!("DEL complete for {}", key);
        Ok(())
    }

    // ── CHECK ─────────────────────────────────────────────────────────

    pub async fn handle_check(&self, req: &AttachmentRequest) -> Result<(), CniError> {
        let ipam_type = req.netconf.ipam_type().to_string();
        let key = result_key(&req.container_id, &req.ifname);
        let plugin_args = Self::plugin_args(req);

        let cached = self
            .ipam
            .load_result(&key)
            .ok_or_else(|| CniError::ResultNotCached(key.clone()))?;

        self.ipam
            .exec_check(&ipam_type, &plugin_args, &req.k8s, &req.netconf_bytes)
            .await?;

        self.configurator.check_interfaces(req, &cached).await?;

        tracing::debug!("CHECK passed for {}", key);
        Ok(())
    }
}

// ── Wire mapping ──────────────────────────────────────────────────────

/// Errors travel in-band: the shim on the far side turns them into CNI spec
/// error JSON, so the transport result is always Ok.
fn error_response(err: &CniError, op_default: ErrorCode) -> CniCmdResponse {
    let code = match err {
        CniError::InvalidConfig(_) => ErrorCode::InvalidNetworkConfig,
        CniError::InvalidArgs(_) => ErrorCode::InvalidEnvironmentVariables,
        CniError::IncompatibleVersion(_) => ErrorCode::IncompatibleCniVersion,
        CniError::DriverNotFound
        | CniError::Delegate(_)
        | CniError::ResultNotCached(_)
        | CniError::PoolExhausted { .. } => ErrorCode::IpamFailure,
        _ => op_default,
    };
    CniCmdResponse {
        cni_result: Vec::new(),
        error: Some(ProtoError {
            code: code as i32,
            message: err.to_string(),
        }),
    }
}

fn success_response(cni_result: Vec<u8>) -> CniCmdResponse {
    CniCmdResponse {
        cni_result,
        error: None,
    }
}

#[tonic::async_trait]
impl Cni for CniService {
    async fn cmd_add(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let req = request.into_inner();
        let response = match Self::parse_request(req.cni_args, true) {
            Ok(parsed) => match self.handle_add(&parsed).await {
                Ok(result) => success_response(result),
                Err(e) => {
                    tracing::error!("ADD failed: {}", e);
                    error_response(&e, ErrorCode::ConfigInterfaceFailure)
                }
            },
            Err(e) => error_response(&e, ErrorCode::InvalidNetworkConfig),
        };
        Ok(Response::new(response))
    }

    async fn cmd_check(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let req = request.into_inner();
        let response = match Self::parse_request(req.cni_args, true) {
            Ok(parsed) => match self.handle_check(&parsed).await {
                Ok(()) => success_response(Vec::new()),
                Err(e) => {
                    tracing::warn!("CHECK failed: {}", e);
                    error_response(&e, ErrorCode::CheckInterfaceFailure)
                }
            },
            Err(e) => error_response(&e, ErrorCode::InvalidNetworkConfig),
        };
        Ok(Response::new(response))
    }

    async fn cmd_del(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let req = request.into_inner();
        let response = match Self::parse_request(req.cni_args, false) {
            Ok(parsed) => match self.handle_del(&parsed).await {
                Ok(()) => success_response(Vec::new()),
                Err(e) => {
                    tracing::error!("DEL failed: {}", e);
                    error_response(&e, ErrorCode::ConfigInterfaceFailure)
                }
            },
            Err(e) => error_response(&e, ErrorCode::InvalidNetworkConfig),
        };
        Ok(Response::new(response))
    }
}
