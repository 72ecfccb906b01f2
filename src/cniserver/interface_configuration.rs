// Interface configuration for both attachment modes.
//
// Veth mode creates a linked pair and splits it across the namespace
// boundary; SR-IOV mode only discovers and binds the pre-existing VF
// representor. Both share one validation contract used on CHECK, and the
// veth construction path accumulates compensating actions on an explicit
// rollback list so a failed ADD never leaves a partial pair behind.

use crate::cniserver::error::CniError;
use crate::cniserver::sriov::SriovResolver;
use crate::cniserver::types::{AttachmentRequest, Interface, IpamResult};
use crate::network::bridge::port_id_for;
use crate::network::error::LinkError;
use crate::network::netlink::{LinkInfo, LinkInspector, NetnsInterfaceSpec, RouteSpec};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

pub const NET_DEVICE_TYPE_VETH: &str = "veth";
pub const NET_DEVICE_TYPE_VF: &str = "vf";

const HOST_IF_PREFIX: &str = "weft-";
const PEER_IF_PREFIX: &str = "wefp-";

/// MTU applied when the network configuration does not carry one,
/// leaving headroom for the dataplane's tunnel encapsulation.
const DEFAULT_MTU: u32 = 1450;

/// Deterministic host-side name for a pod interface. DEL and CHECK re-derive
/// it from the request alone; no external state is consulted. 15 chars, the
/// kernel's IFNAMSIZ budget.
pub fn host_interface_name(container_id: &str, ifname: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}", container_id, ifname).as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}{}", HOST_IF_PREFIX, &hex[..10])
}

/// Temporary name the container-side end carries until it is renamed inside
/// the namespace. Same hash, different prefix, so the two ends never collide.
fn peer_interface_name(container_id: &str, ifname: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}", container_id, ifname).as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}{}", PEER_IF_PREFIX, &hex[..10])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    Veth,
    VfRepresentor,
}

/// Container-side veth bookkeeping used during validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VethPair {
    pub name: String,
    pub if_index: u32,
    pub peer_index: u32,
}

/// What a successful configuration hands back to the protocol server.
#[derive(Debug, Clone)]
pub struct ConfiguredInterface {
    pub mode: AttachmentMode,
    pub host: LinkInfo,
    /// Container-side link; None in SR-IOV mode, where the VF itself lives
    /// in the pod and only the representor is agent-visible.
    pub container: Option<LinkInfo>,
    pub port_id: Uuid,
}

// ── Rollback ──────────────────────────────────────────────────────────

type CleanupFuture = futures::future::BoxFuture<'static, Result<(), LinkError>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Ordered list of compensating actions accumulated while construction
/// proceeds. Runs in reverse only when a step fails before completion;
/// a completed construction disarms it. Compensation failures are logged
/// and never mask the error that triggered the rollback.
#[must_use]
pub struct Rollback {
    steps: Vec<(&'static str, CleanupFn)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push<F>(&mut self, what: &'static str, f: F)
    where
        F: FnOnce() -> CleanupFuture + Send + 'static,
    {
        self.steps.push((what, Box::new(f)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Construction completed; nothing to compensate.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Execute compensations in reverse registration order.
    pub async fn run(mut self) {
        while let Some((what, cleanup)) = self.steps.pop() {
            if let Err(e) = cleanup().await {
                tracing::warn!("Rollback step '{}' failed: {}", what, e);
            } else {
                tracing::debug!("Rolled back: {}", what);
            }
        }
    }
}

impl Default for Rollback {
    fn default() -> Self {
        Self::new()
    }
}

// ── Configurator ──────────────────────────────────────────────────────

pub struct InterfaceConfigurator {
    links: Arc<dyn LinkInspector>,
    sriov: SriovResolver,
}

impl InterfaceConfigurator {
    pub fn new(links: Arc<dyn LinkInspector>) -> Self {
        Self {
            links,
            sriov: SriovResolver::new(),
        }
    }

    pub fn with_sriov(links: Arc<dyn LinkInspector>, sriov: SriovResolver) -> Self {
        Self { links, sriov }
    }

    pub fn attachment_mode(req: &AttachmentRequest) -> AttachmentMode {
        if req.netconf.device_id.is_some() {
            AttachmentMode::VfRepresentor
        } else {
            AttachmentMode::Veth
        }
    }

    /// Materialize the interface topology for an ADD.
    pub async fn configure_interfaces(
        &self,
        req: &AttachmentRequest,
        ipam: &IpamResult,
    ) -> Result<ConfiguredInterface, CniError> {
        match Self::attachment_mode(req) {
            AttachmentMode::Veth => self.configure_veth(req, ipam).await,
            AttachmentMode::VfRepresentor => self.bind_vf_representor(req).await,
        }
    }

    async fn configure_veth(
        &self,
        req: &AttachmentRequest,
        ipam: &IpamResult,
    ) -> Result<ConfiguredInterface, CniError> {
        let host_name = host_interface_name(&req.container_id, &req.ifname);
        let peer_name = peer_interface_name(&req.container_id, &req.ifname);

        let mut rollback = Rollback::new();

        let (host, peer) = self.links.create_veth_pair(&host_name, &peer_name).await?;
        {
            // Deleting the host end removes the whole pair, wherever the
            // peer ended up
            let links = self.links.clone();
            let host_name = host_name.clone();
            rollback.push("delete veth pair", move || {
                Box::pin(async move { links.delete_link(&host_name).await })
            });
        }

        let outcome: Result<LinkInfo, CniError> = async {
            self.links.set_link_netns(peer.index, &req.netns).await?;

            let spec = self.netns_spec(req, ipam, &peer_name);
            let container = self.links.configure_in_netns(&req.netns, spec).await?;

            self.links.set_link_up(host.index).await?;
            Ok(container)
        }
        .await;

        match outcome {
            Ok(container) => {
                rollback.disarm();
                tracing::info!(
                    "Configured veth pair {} <-> {} for container {}",
                    host_name,
                    container.name,
                    req.container_id
                );
                Ok(ConfiguredInterface {
                    mode: AttachmentMode::Veth,
                    port_id: port_id_for(&host.name),
                    host,
                    container: Some(container),
                })
            }
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    fn netns_spec(
        &self,
        req: &AttachmentRequest,
        ipam: &IpamResult,
        temp_name: &str,
    ) -> NetnsInterfaceSpec {
        let default_gateway = ipam.result.ips.first().and_then(|ip| ip.gateway);
        NetnsInterfaceSpec {
            device: temp_name.to_string(),
            rename_to: req.ifname.clone(),
            mtu: Some(req.netconf.mtu.unwrap_or(DEFAULT_MTU)),
            addresses: ipam.result.ips.iter().map(|ip| ip.address).collect(),
            routes: ipam
                .result
                .routes
                .iter()
                .map(|r| RouteSpec {
                    destination: r.dst,
                    // CNI: a route without an explicit gateway uses the
                    // address's one
                    gateway: r.gw.or(default_gateway),
                })
                .collect(),
        }
    }

    /// SR-IOV attachment: resolve and bind the pre-existing representor.
    /// Discovery only; nothing is created, nothing needs rollback.
    async fn bind_vf_representor(
        &self,
        req: &AttachmentRequest,
    ) -> Result<ConfiguredInterface, CniError> {
        let device_id = req.netconf.device_id.as_deref().ok_or_else(|| {
            CniError::InvalidConfig("SR-IOV attachment requires a deviceID".to_string())
        })?;

        let rep_name = self.validate_vf_rep_interface(device_id)?;
        let host = self
            .links
            .link_by_name(&rep_name)
            .await
            .map_err(|_| CniError::LinkNotFound(rep_name.clone()))?;
        self.links.set_link_up(host.index).await?;

        tracing::info!(
            "Bound VF representor {} (device {}) for container {}",
            rep_name,
            device_id,
            req.container_id
        );
        Ok(ConfiguredInterface {
            mode: AttachmentMode::VfRepresentor,
            port_id: port_id_for(&host.name),
            host,
            container: None,
        })
    }

    /// Resolve a PCI device address to its VF representor name. Each
    /// resolution step fails with its own error.
    pub fn validate_vf_rep_interface(&self, device_id: &str) -> Result<String, CniError> {
        self.sriov.resolve_representor(device_id)
    }

    /// Tear down whatever ADD built. Absent resources are success: the
    /// desired end state is already reached.
    pub async fn remove_interfaces(&self, req: &AttachmentRequest) -> Result<(), CniError> {
        match Self::attachment_mode(req) {
            AttachmentMode::Veth => {
                let host_name = host_interface_name(&req.container_id, &req.ifname);
                self.links.delete_link(&host_name).await?;
                tracing::info!(
                    "Removed host interface {} for container {}",
                    host_name,
                    req.container_id
                );
                Ok(())
            }
            // The representor belongs to the NIC driver; it survives the pod
            AttachmentMode::VfRepresentor => Ok(()),
        }
    }

    /// Rediscover the host-side partner of the container interface, crossing
    /// the namespace boundary. Never silently returns a zero value.
    pub async fn discover_container_peer(
        &self,
        netns: &str,
        ifname: &str,
    ) -> Result<(VethPair, LinkInfo), CniError> {
        let container = self
            .links
            .ns_link_by_name(netns, ifname)
            .await
            .map_err(|_| CniError::LinkNotFound(ifname.to_string()))?;
        let peer_index = container
            .peer_index
            .ok_or_else(|| CniError::PeerNotFound(ifname.to_string()))?;
        let host = self
            .links
            .link_by_index(peer_index)
            .await
            .map_err(|_| CniError::PeerNotFound(ifname.to_string()))?;

        Ok((
            VethPair {
                name: container.name,
                if_index: container.index,
                peer_index,
            },
            host,
        ))
    }

    /// CHECK: compare the live topology against the one implied by the
    /// original request and its recorded result. Read-only.
    pub async fn check_interfaces(
        &self,
        req: &AttachmentRequest,
        ipam: &IpamResult,
    ) -> Result<(), CniError> {
        match Self::attachment_mode(req) {
            AttachmentMode::Veth => self.check_veth_interfaces(req, ipam).await,
            AttachmentMode::VfRepresentor => {
                let device_id = req.netconf.device_id.as_deref().ok_or_else(|| {
                    CniError::InvalidConfig("SR-IOV attachment requires a deviceID".to_string())
                })?;
                let rep_name = self.validate_vf_rep_interface(device_id)?;
                self.links
                    .link_by_name(&rep_name)
                    .await
                    .map_err(|_| CniError::LinkNotFound(rep_name.clone()))?;
                Ok(())
            }
        }
    }

    async fn check_veth_interfaces(
        &self,
        req: &AttachmentRequest,
        ipam: &IpamResult,
    ) -> Result<(), CniError> {
        let (container_veth, host) = self
            .discover_container_peer(&req.netns, &req.ifname)
            .await?;

        // The discovered peer must be the deterministically-named host end
        let expected_host = host_interface_name(&req.container_id, &req.ifname);
        if host.name != expected_host {
            return Err(CniError::LinkNotFound(expected_host));
        }
        if !host.is_veth() {
            return Err(CniError::UnknownDeviceType(NET_DEVICE_TYPE_VETH.to_string()));
        }
        // And the pairing must hold in both directions
        if let Some(host_peer) = host.peer_index {
            if host_peer != container_veth.if_index {
                return Err(CniError::PeerNotFound(container_veth.name.clone()));
            }
        }

        // The prevResult the runtime sent back (or the recorded result, when
        // it names interfaces) must still describe this topology
        let declared = req
            .netconf
            .prev_result
            .as_ref()
            .map(|r| r.interfaces.as_slice())
            .or_else(|| {
                (!ipam.result.interfaces.is_empty()).then(|| ipam.result.interfaces.as_slice())
            });
        if let Some(declared) = declared {
            validate_container_peer_interface(declared, &container_veth)?;
            // The declared host entry, when present, must still resolve to a
            // veth outside any namespace
            if let Some(host_entry) = declared.iter().find(|i| i.name == host.name) {
                validate_interface(
                    self.links.as_ref(),
                    host_entry,
                    false,
                    NET_DEVICE_TYPE_VETH,
                )
                .await?;
            }
        }
        Ok(())
    }
}

// ── Validation ────────────────────────────────────────────────────────

/// Validate one declared interface against where and what it must be.
/// Checks run in a fixed order: name, namespace membership, link
/// resolvability, device type. An unrecognized declared type is always
/// rejected, even when the underlying link exists.
pub async fn validate_interface(
    links: &dyn LinkInspector,
    intf: &Interface,
    in_netns: bool,
    if_type: &str,
) -> Result<LinkInfo, CniError> {
    if intf.name.is_empty() {
        return Err(CniError::MissingName);
    }

    let sandbox = intf.sandbox.as_deref().unwrap_or("");
    if in_netns && sandbox.is_empty() {
        return Err(CniError::ExpectedInNetns(intf.name.clone()));
    }
    if !in_netns && !sandbox.is_empty() {
        return Err(CniError::ExpectedNotInNetns(intf.name.clone()));
    }

    let link = links
        .link_by_name(&intf.name)
        .await
        .map_err(|_| CniError::LinkNotFound(intf.name.clone()))?;

    match if_type {
        NET_DEVICE_TYPE_VETH => {
            if !link.is_veth() {
                return Err(CniError::UnknownDeviceType(NET_DEVICE_TYPE_VETH.to_string()));
            }
            Ok(link)
        }
        // VFs expose no kind through netlink, so the type check is bypassed
        NET_DEVICE_TYPE_VF => Ok(link),
        other => Err(CniError::UnknownDeviceType(other.to_string())),
    }
}

/// Find the declared entry for a known container-side veth. The entry must
/// exist and must carry a sandbox reference, otherwise the topology no
/// longer matches what was recorded.
pub fn validate_container_peer_interface(
    interfaces: &[Interface],
    container_veth: &VethPair,
) -> Result<Interface, CniError> {
    for intf in interfaces {
        if intf.name != container_veth.name {
            continue;
        }
        if intf.sandbox.as_deref().unwrap_or("").is_empty() {
            return Err(CniError::PeerNotFound(container_veth.name.clone()));
        }
        return Ok(intf.clone());
    }
    Err(CniError::PeerNotFound(container_veth.name.clone()))
}
