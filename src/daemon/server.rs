// Agent bootstrap: build the shared components once, then serve the CNI
// protocol on a local unix socket until shutdown.

use crate::cniserver::interface_configuration::InterfaceConfigurator;
use crate::cniserver::ipam::delegator::{IpamDelegator, PluginRunner, IPAM_HOST_LOCAL};
use crate::cniserver::ipam::pool::NodeIpamPool;
use crate::cniserver::ipam::{IpamRegistry, BUILTIN_IPAM_TYPE};
use crate::cniserver::CniService;
use crate::network::bridge::BridgeManager;
use crate::network::netlink::NetlinkHandle;
use crate::proto::cni_server::CniServer;
use crate::utils::logger::Logger;
use crate::utils::server_manager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

const DEFAULT_SOCK_PATH: &str = "/var/run/weft/cni.sock";
const DEFAULT_BRIDGE_NAME: &str = "weft0";
/// Default node PodCIDR for single-node deployments.
/// Multi-node deployments should set a non-overlapping per-node PodCIDR.
const DEFAULT_NODE_POD_CIDR: &str = "10.42.0.0/16";
const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub sock_path: String,
    pub bridge_name: String,
    pub pod_cidr: String,
    pub pool_vlan: u16,
    pub plugin_timeout: Duration,
}

impl DaemonConfig {
    /// Resolve the effective configuration: CLI flag, then `WEFT_*`
    /// environment variable, then default.
    pub fn resolve(
        sock: Option<String>,
        bridge: Option<String>,
        pod_cidr: Option<String>,
        vlan: Option<u16>,
        plugin_timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            sock_path: sock
                .or_else(|| std::env::var("WEFT_SOCK").ok())
                .unwrap_or_else(|| DEFAULT_SOCK_PATH.to_string()),
            bridge_name: bridge
                .or_else(|| std::env::var("WEFT_BRIDGE").ok())
                .unwrap_or_else(|| DEFAULT_BRIDGE_NAME.to_string()),
            pod_cidr: pod_cidr
                .or_else(|| std::env::var("WEFT_POD_CIDR").ok())
                .unwrap_or_else(|| DEFAULT_NODE_POD_CIDR.to_string()),
            pool_vlan: vlan
                .or_else(|| std::env::var("WEFT_POOL_VLAN").ok().and_then(|v| v.parse().ok()))
                .unwrap_or(0),
            plugin_timeout: Duration::from_secs(
                plugin_timeout_secs
                    .or_else(|| {
                        std::env::var("WEFT_PLUGIN_TIMEOUT")
                            .ok()
                            .and_then(|v| v.parse().ok())
                    })
                    .unwrap_or(DEFAULT_PLUGIN_TIMEOUT_SECS),
            ),
        }
    }
}

/// Run the weft node agent. Entry point for daemon mode.
pub async fn run_server(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Record our PID so --status/--stop can find us
    server_manager::write_pid_file(std::process::id())?;

    let result = run_server_impl(config).await;

    // Clean up PID file on exit
    server_manager::remove_pid_file();

    result
}

async fn run_server_impl(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let links = Arc::new(NetlinkHandle::new()?);

    // The bridge must be ready before the first attach request lands
    let bridge = Arc::new(BridgeManager::new(&config.bridge_name, links.clone()));
    bridge.ensure_ready().await?;
    Logger::success(&format!("Bridge {} ready", config.bridge_name));

    // IPAM drivers: delegation to the standard host-local plugin plus the
    // in-process node pool, both through the same registry
    let ipam = Arc::new(IpamRegistry::new());
    let runner = Arc::new(PluginRunner::with_timeout(config.plugin_timeout));
    ipam.register(
        IPAM_HOST_LOCAL,
        Arc::new(IpamDelegator::new(IPAM_HOST_LOCAL, runner)),
    );
    ipam.register(
        BUILTIN_IPAM_TYPE,
        Arc::new(NodeIpamPool::new(
            "node-pool",
            &config.pod_cidr,
            config.pool_vlan,
        )?),
    );
    Logger::success(&format!(
        "IPAM ready ({} delegate + {} pool {})",
        IPAM_HOST_LOCAL, BUILTIN_IPAM_TYPE, config.pod_cidr
    ));

    let configurator = Arc::new(InterfaceConfigurator::new(links));
    let service = CniService::new(ipam, configurator, bridge);

    // Bind the protocol socket, replacing any stale one from a crashed run
    if let Some(parent) = Path::new(&config.sock_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::remove_file(&config.sock_path).is_ok() {
        Logger::warning(&format!("Removed stale socket {}", config.sock_path));
    }
    let listener = UnixListener::bind(&config.sock_path)?;
    let incoming = UnixListenerStream::new(listener);

    Logger::success(&format!("weft agent listening on {}", config.sock_path));
    Logger::detail("bridge", &config.bridge_name);
    Logger::detail("pod CIDR", &config.pod_cidr);

    tokio::select! {
        result = Server::builder()
            .add_service(CniServer::new(service))
            .serve_with_incoming(incoming) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            Logger::info("Received shutdown signal, cleaning up...");
        }
    }

    let _ = std::fs::remove_file(&config.sock_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_resolution_prefers_explicit_flags() {
        let config = DaemonConfig::resolve(
            Some("/tmp/weft-test.sock".to_string()),
            Some("br-test".to_string()),
            Some("10.9.0.0/24".to_string()),
            Some(42),
            Some(3),
        );
        assert_eq!(config.sock_path, "/tmp/weft-test.sock");
        assert_eq!(config.bridge_name, "br-test");
        assert_eq!(config.pod_cidr, "10.9.0.0/24");
        assert_eq!(config.pool_vlan, 42);
        assert_eq!(config.plugin_timeout, Duration::from_secs(3));
    }

    #[test]
    fn config_resolution_falls_back_to_defaults() {
        let config = DaemonConfig::resolve(None, None, None, None, None);
        assert_eq!(config.bridge_name, DEFAULT_BRIDGE_NAME);
        assert_eq!(config.pod_cidr, DEFAULT_NODE_POD_CIDR);
        assert_eq!(config.pool_vlan, 0);
    }
}
