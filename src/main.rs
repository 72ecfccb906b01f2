// weft unified binary: node agent daemon plus minimal lifecycle commands.

mod cniserver;
mod daemon;
mod network;
mod utils;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("weft.cni");
}

use clap::{Parser, Subcommand};
use utils::logger::Logger;
use utils::server_manager;

/// weft - per-node network attachment agent
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-node network attachment agent for the weft dataplane")]
#[clap(propagate_version = true)]
struct WeftCli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the weft node agent
    Daemon {
        /// CNI protocol socket path (default: /var/run/weft/cni.sock)
        #[clap(long)]
        sock: Option<String>,

        /// Managed bridge name (default: weft0)
        #[clap(long)]
        bridge: Option<String>,

        /// Node PodCIDR served by the built-in IPAM pool
        #[clap(long)]
        pod_cidr: Option<String>,

        /// VLAN id tagged onto pool allocations
        #[clap(long)]
        vlan: Option<u16>,

        /// Timeout for delegated IPAM plugin execution, in seconds
        #[clap(long)]
        plugin_timeout: Option<u64>,

        /// Show daemon status
        #[clap(long)]
        status: bool,

        /// Stop the running daemon
        #[clap(long)]
        stop: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = WeftCli::parse();

    match cli.command {
        Commands::Daemon {
            sock,
            bridge,
            pod_cidr,
            vlan,
            plugin_timeout,
            status,
            stop,
        } => {
            if status {
                match server_manager::daemon_running() {
                    Some(pid) => Logger::success(&format!("weft agent running (pid {})", pid)),
                    None => Logger::info("weft agent is not running"),
                }
                return;
            }

            if stop {
                match server_manager::stop_daemon() {
                    Ok(pid) => Logger::success(&format!("Stopped weft agent (pid {})", pid)),
                    Err(e) => {
                        Logger::error(&e);
                        std::process::exit(1);
                    }
                }
                return;
            }

            let config =
                daemon::server::DaemonConfig::resolve(sock, bridge, pod_cidr, vlan, plugin_timeout);
            if let Err(e) = daemon::server::run_server(config).await {
                Logger::error(&format!("Agent failed: {}", e));
                std::process::exit(1);
            }
        }
    }
}
