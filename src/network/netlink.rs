use crate::network::error::{LinkError, LinkResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;

/// What the kernel reports about a single link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mac: Option<String>,
    /// Kernel device kind ("veth", "bridge", ...). None for physical devices
    /// and VFs, which carry no IFLA_INFO_KIND.
    pub kind: Option<String>,
    /// Peer ifindex for veth links (resolved in the peer's namespace).
    pub peer_index: Option<u32>,
    pub mtu: Option<u32>,
}

impl LinkInfo {
    pub fn is_veth(&self) -> bool {
        self.kind.as_deref() == Some("veth")
    }
}

/// A route to install inside a container namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub destination: ipnet::IpNet,
    pub gateway: Option<IpAddr>,
}

/// Everything applied to a container-side interface in one in-namespace pass:
/// rename, MTU, addresses, routes, link up.
#[derive(Debug, Clone)]
pub struct NetnsInterfaceSpec {
    /// Current (temporary) device name inside the namespace.
    pub device: String,
    /// Requested container interface name to rename to.
    pub rename_to: String,
    pub mtu: Option<u32>,
    pub addresses: Vec<ipnet::IpNet>,
    pub routes: Vec<RouteSpec>,
}

/// Capability interface over kernel link inspection and mutation.
///
/// The interface configurator and bridge manager are written against this
/// trait so tests can substitute an in-memory implementation; `NetlinkHandle`
/// is the production implementation.
#[async_trait]
pub trait LinkInspector: Send + Sync {
    async fn link_by_name(&self, name: &str) -> LinkResult<LinkInfo>;
    async fn link_by_index(&self, index: u32) -> LinkResult<LinkInfo>;
    /// Create a veth pair in the host namespace. Stale links with either name
    /// are removed first so a retried ADD does not trip over its own debris.
    async fn create_veth_pair(&self, name: &str, peer_name: &str)
        -> LinkResult<(LinkInfo, LinkInfo)>;
    /// Delete a link by name. Idempotent: an absent link is success.
    async fn delete_link(&self, name: &str) -> LinkResult<()>;
    /// Create a bridge device. Idempotent: an existing bridge is success.
    /// Returns the bridge ifindex.
    async fn create_bridge(&self, name: &str) -> LinkResult<u32>;
    async fn set_link_up(&self, index: u32) -> LinkResult<()>;
    /// Attach a link to a bridge by ifindex.
    async fn set_link_master(&self, index: u32, master_index: u32) -> LinkResult<()>;
    /// Move a link into the network namespace at `ns_path`.
    async fn set_link_netns(&self, index: u32, ns_path: &str) -> LinkResult<()>;
    /// Look up a link inside the namespace at `ns_path`.
    async fn ns_link_by_name(&self, ns_path: &str, name: &str) -> LinkResult<LinkInfo>;
    /// Rename, address and bring up a container-side interface inside its
    /// namespace. Returns the link as it looks after configuration.
    async fn configure_in_netns(&self, ns_path: &str, spec: NetnsInterfaceSpec)
        -> LinkResult<LinkInfo>;
}

/// Persistent netlink handle wrapping rtnetlink for all link operations.
/// One handle per process, reused across all attach/detach requests.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    /// Create a new netlink handle with a persistent connection
    pub fn new() -> LinkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    async fn get_link_message(
        &self,
        name: &str,
    ) -> LinkResult<netlink_packet_route::LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(LinkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink returns an error for "not found" on some kernels
                if e.to_string().contains("No such device") {
                    Err(LinkError::NotFound(format!("link {}", name)))
                } else {
                    Err(LinkError::Netlink(e))
                }
            }
        }
    }
}

#[async_trait]
impl LinkInspector for NetlinkHandle {
    async fn link_by_name(&self, name: &str) -> LinkResult<LinkInfo> {
        let msg = self.get_link_message(name).await?;
        Ok(link_info_from_message(&msg))
    }

    async fn link_by_index(&self, index: u32) -> LinkResult<LinkInfo> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(link_info_from_message(&msg)),
            Ok(None) => Err(LinkError::NotFound(format!("link index {}", index))),
            Err(e) => {
                if e.to_string().contains("No such device") {
                    Err(LinkError::NotFound(format!("link index {}", index)))
                } else {
                    Err(LinkError::Netlink(e))
                }
            }
        }
    }

    async fn create_veth_pair(
        &self,
        name: &str,
        peer_name: &str,
    ) -> LinkResult<(LinkInfo, LinkInfo)> {
        // Clean up stale interfaces first (idempotent)
        self.delete_link(name).await?;
        self.delete_link(peer_name).await?;

        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer_name.to_string())
            .execute()
            .await
            .map_err(LinkError::Netlink)?;

        let host = self.link_by_name(name).await?;
        let peer = self.link_by_name(peer_name).await?;

        Ok((host, peer))
    }

    async fn delete_link(&self, name: &str) -> LinkResult<()> {
        let msg = match self.get_link_message(name).await {
            Ok(msg) => msg,
            Err(LinkError::NotFound(_)) => return Ok(()), // already gone
            Err(e) => return Err(e),
        };

        match self.handle.link().del(msg.header.index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(LinkError::Netlink(e)),
        }
    }

    async fn create_bridge(&self, name: &str) -> LinkResult<u32> {
        // Check if the bridge already exists
        if let Ok(link) = self.link_by_name(name).await {
            return Ok(link.index);
        }

        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|e| {
                // If it already exists (race condition), that's fine
                if e.to_string().contains("File exists") {
                    return LinkError::AlreadyExists(name.to_string());
                }
                LinkError::Netlink(e)
            })?;

        Ok(self.link_by_name(name).await?.index)
    }

    async fn set_link_up(&self, index: u32) -> LinkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(LinkError::Netlink)
    }

    async fn set_link_master(&self, index: u32, master_index: u32) -> LinkResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(LinkError::Netlink)
    }

    async fn set_link_netns(&self, index: u32, ns_path: &str) -> LinkResult<()> {
        let ns_fd = std::fs::File::open(ns_path)
            .map_err(|e| LinkError::Namespace(format!("failed to open {}: {}", ns_path, e)))?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd.as_raw_fd())
            .execute()
            .await
            .map_err(LinkError::Netlink)
    }

    async fn ns_link_by_name(&self, ns_path: &str, name: &str) -> LinkResult<LinkInfo> {
        let ns_path = ns_path.to_string();
        let name = name.to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result = in_netns(&ns_path, move |handle| {
                Box::pin(async move {
                    let mut links = handle.link().get().match_name(name.clone()).execute();
                    match links.try_next().await {
                        Ok(Some(msg)) => Ok(link_info_from_message(&msg)),
                        Ok(None) => Err(LinkError::NotFound(format!("link {} in netns", name))),
                        Err(e) => {
                            if e.to_string().contains("No such device") {
                                Err(LinkError::NotFound(format!("link {} in netns", name)))
                            } else {
                                Err(LinkError::Netlink(e))
                            }
                        }
                    }
                })
            });
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| LinkError::Namespace("in-namespace thread panicked".to_string()))?
    }

    async fn configure_in_netns(
        &self,
        ns_path: &str,
        spec: NetnsInterfaceSpec,
    ) -> LinkResult<LinkInfo> {
        let ns_path = ns_path.to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result = in_netns(&ns_path, move |handle| {
                Box::pin(async move { do_configure_interface(handle, spec).await })
            });
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| LinkError::Namespace("in-namespace thread panicked".to_string()))?
    }
}

// setns() affects the calling OS thread. We MUST use std::thread::spawn,
// never a tokio task, for in-namespace netlink operations. The closure runs
// on a dedicated thread with a single-threaded runtime and a netlink
// connection created inside the target namespace.
fn in_netns<T, F>(ns_path: &str, f: F) -> LinkResult<T>
where
    T: Send + 'static,
    F: FnOnce(rtnetlink::Handle) -> futures::future::BoxFuture<'static, LinkResult<T>>,
{
    use nix::sched::{setns, CloneFlags};

    let ns_fd = std::fs::File::open(ns_path)
        .map_err(|e| LinkError::Namespace(format!("failed to open {}: {}", ns_path, e)))?;

    setns(ns_fd.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| LinkError::Namespace(format!("setns failed for {}: {}", ns_path, e)))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(LinkError::Io)?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        f(handle).await
    })
}

/// Actual in-namespace interface configuration (runs on a dedicated OS thread)
async fn do_configure_interface(
    handle: rtnetlink::Handle,
    spec: NetnsInterfaceSpec,
) -> LinkResult<LinkInfo> {
    // 1. Find the temporary device moved into this namespace
    let mut links = handle
        .link()
        .get()
        .match_name(spec.device.clone())
        .execute();
    let msg = links
        .try_next()
        .await
        .map_err(LinkError::Netlink)?
        .ok_or_else(|| LinkError::NotFound(format!("link {} in container netns", spec.device)))?;
    let index = msg.header.index;

    // 2. Rename to the requested interface name (link is still down here,
    //    a rename on a running link would be refused by the kernel)
    handle
        .link()
        .set(index)
        .name(spec.rename_to.clone())
        .execute()
        .await
        .map_err(LinkError::Netlink)?;

    // 3. MTU
    if let Some(mtu) = spec.mtu {
        handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(LinkError::Netlink)?;
    }

    // 4. Addresses from the IPAM result
    for net in &spec.addresses {
        let result = handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await;
        match result {
            Ok(()) => {}
            Err(e) if e.to_string().contains("File exists") => {} // already assigned
            Err(e) => return Err(LinkError::Netlink(e)),
        }
    }

    // 5. Bring interface up
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(LinkError::Netlink)?;

    // 6. Bring loopback up
    if let Ok(Some(lo_msg)) = handle
        .link()
        .get()
        .match_name("lo".to_string())
        .execute()
        .try_next()
        .await
    {
        let _ = handle.link().set(lo_msg.header.index).up().execute().await;
    }

    // 7. Routes (the default route via the gateway included)
    for route in &spec.routes {
        add_route(&handle, index, route).await?;
    }

    // Re-read so the caller sees the post-rename name and kernel MAC
    let mut links = handle
        .link()
        .get()
        .match_name(spec.rename_to.clone())
        .execute();
    let msg = links
        .try_next()
        .await
        .map_err(LinkError::Netlink)?
        .ok_or_else(|| {
            LinkError::NotFound(format!("link {} in container netns", spec.rename_to))
        })?;
    Ok(link_info_from_message(&msg))
}

async fn add_route(
    handle: &rtnetlink::Handle,
    out_index: u32,
    route: &RouteSpec,
) -> LinkResult<()> {
    let result = match (&route.destination, route.gateway) {
        (ipnet::IpNet::V4(dst), Some(IpAddr::V4(gw))) => {
            handle
                .route()
                .add()
                .v4()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .gateway(gw)
                .execute()
                .await
        }
        (ipnet::IpNet::V4(dst), None) => {
            handle
                .route()
                .add()
                .v4()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .output_interface(out_index)
                .execute()
                .await
        }
        (ipnet::IpNet::V6(dst), Some(IpAddr::V6(gw))) => {
            handle
                .route()
                .add()
                .v6()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .gateway(gw)
                .execute()
                .await
        }
        (ipnet::IpNet::V6(dst), None) => {
            handle
                .route()
                .add()
                .v6()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .output_interface(out_index)
                .execute()
                .await
        }
        // Mixed-family route, nothing sane to install
        _ => {
            return Err(LinkError::Namespace(format!(
                "route family mismatch: {} via {:?}",
                route.destination, route.gateway
            )))
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("File exists") => Ok(()), // already has route
        Err(e) => Err(LinkError::Netlink(e)),
    }
}

fn link_info_from_message(msg: &netlink_packet_route::LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        index: msg.header.index,
        ..Default::default()
    };

    for nla in &msg.nlas {
        match nla {
            LinkNla::IfName(name) => info.name = name.clone(),
            LinkNla::Address(bytes) => info.mac = Some(format_mac(bytes)),
            LinkNla::Mtu(mtu) => info.mtu = Some(*mtu),
            // IFLA_LINK: the peer ifindex for veth links
            LinkNla::Link(peer) => info.peer_index = Some(*peer),
            LinkNla::Info(infos) => {
                for i in infos {
                    if let Info::Kind(kind) = i {
                        info.kind = Some(kind_name(kind));
                    }
                }
            }
            _ => {}
        }
    }

    info
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".to_string(),
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Bond => "bond".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        InfoKind::Vxlan => "vxlan".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
pub mod testing {
    //! In-memory LinkInspector used by configurator and server tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    pub struct MockLinkInspector {
        /// Host-namespace links by name
        links: Mutex<HashMap<String, LinkInfo>>,
        /// Container-namespace links by (ns path, name)
        ns_links: Mutex<HashMap<(String, String), LinkInfo>>,
        deleted: Mutex<Vec<String>>,
        next_index: AtomicU32,
        /// Force set_link_netns to fail, exercising the rollback path
        pub fail_netns_move: AtomicBool,
    }

    impl MockLinkInspector {
        pub fn new() -> Self {
            Self {
                next_index: AtomicU32::new(1),
                ..Default::default()
            }
        }

        fn alloc_index(&self) -> u32 {
            self.next_index.fetch_add(1, Ordering::Relaxed)
        }

        pub fn add_host_link(&self, link: LinkInfo) {
            self.links.lock().insert(link.name.clone(), link);
        }

        pub fn add_ns_link(&self, ns_path: &str, link: LinkInfo) {
            self.ns_links
                .lock()
                .insert((ns_path.to_string(), link.name.clone()), link);
        }

        pub fn deleted_links(&self) -> Vec<String> {
            self.deleted.lock().clone()
        }

        pub fn host_link_names(&self) -> Vec<String> {
            self.links.lock().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl LinkInspector for MockLinkInspector {
        async fn link_by_name(&self, name: &str) -> LinkResult<LinkInfo> {
            self.links
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| LinkError::NotFound(format!("link {}", name)))
        }

        async fn link_by_index(&self, index: u32) -> LinkResult<LinkInfo> {
            self.links
                .lock()
                .values()
                .find(|l| l.index == index)
                .cloned()
                .ok_or_else(|| LinkError::NotFound(format!("link index {}", index)))
        }

        async fn create_veth_pair(
            &self,
            name: &str,
            peer_name: &str,
        ) -> LinkResult<(LinkInfo, LinkInfo)> {
            let host_idx = self.alloc_index();
            let peer_idx = self.alloc_index();
            let host = LinkInfo {
                name: name.to_string(),
                index: host_idx,
                mac: Some("aa:aa:aa:00:00:01".to_string()),
                kind: Some("veth".to_string()),
                peer_index: Some(peer_idx),
                mtu: Some(1500),
            };
            let peer = LinkInfo {
                name: peer_name.to_string(),
                index: peer_idx,
                mac: Some("aa:aa:aa:00:00:02".to_string()),
                kind: Some("veth".to_string()),
                peer_index: Some(host_idx),
                mtu: Some(1500),
            };
            let mut links = self.links.lock();
            links.insert(host.name.clone(), host.clone());
            links.insert(peer.name.clone(), peer.clone());
            Ok((host, peer))
        }

        async fn delete_link(&self, name: &str) -> LinkResult<()> {
            self.links.lock().remove(name);
            self.deleted.lock().push(name.to_string());
            Ok(())
        }

        async fn create_bridge(&self, name: &str) -> LinkResult<u32> {
            if let Some(existing) = self.links.lock().get(name) {
                return Ok(existing.index);
            }
            let idx = self.alloc_index();
            self.links.lock().insert(
                name.to_string(),
                LinkInfo {
                    name: name.to_string(),
                    index: idx,
                    kind: Some("bridge".to_string()),
                    ..Default::default()
                },
            );
            Ok(idx)
        }

        async fn set_link_up(&self, index: u32) -> LinkResult<()> {
            let has_host = self.links.lock().values().any(|l| l.index == index);
            let has_ns = self.ns_links.lock().values().any(|l| l.index == index);
            if has_host || has_ns {
                Ok(())
            } else {
                Err(LinkError::NotFound(format!("link index {}", index)))
            }
        }

        async fn set_link_master(&self, index: u32, _master_index: u32) -> LinkResult<()> {
            if self.links.lock().values().any(|l| l.index == index) {
                Ok(())
            } else {
                Err(LinkError::NotFound(format!("link index {}", index)))
            }
        }

        async fn set_link_netns(&self, index: u32, ns_path: &str) -> LinkResult<()> {
            if self.fail_netns_move.load(Ordering::Relaxed) {
                return Err(LinkError::Namespace(format!(
                    "failed to open {}: simulated",
                    ns_path
                )));
            }
            let link = {
                let mut links = self.links.lock();
                let name = links
                    .values()
                    .find(|l| l.index == index)
                    .map(|l| l.name.clone())
                    .ok_or_else(|| LinkError::NotFound(format!("link index {}", index)))?;
                links.remove(&name)
            };
            if let Some(link) = link {
                self.ns_links
                    .lock()
                    .insert((ns_path.to_string(), link.name.clone()), link);
            }
            Ok(())
        }

        async fn ns_link_by_name(&self, ns_path: &str, name: &str) -> LinkResult<LinkInfo> {
            self.ns_links
                .lock()
                .get(&(ns_path.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| LinkError::NotFound(format!("link {} in netns", name)))
        }

        async fn configure_in_netns(
            &self,
            ns_path: &str,
            spec: NetnsInterfaceSpec,
        ) -> LinkResult<LinkInfo> {
            let mut ns_links = self.ns_links.lock();
            let key = (ns_path.to_string(), spec.device.clone());
            let mut link = ns_links.remove(&key).ok_or_else(|| {
                LinkError::NotFound(format!("link {} in container netns", spec.device))
            })?;
            link.name = spec.rename_to.clone();
            if spec.mtu.is_some() {
                link.mtu = spec.mtu;
            }
            ns_links.insert((ns_path.to_string(), link.name.clone()), link.clone());
            Ok(link)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_mac_address() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0x0c, 0x01, 0x02, 0x03]),
            "aa:bb:0c:01:02:03"
        );
    }

    #[test]
    fn veth_kind_detection() {
        let link = LinkInfo {
            kind: Some("veth".to_string()),
            ..Default::default()
        };
        assert!(link.is_veth());

        let phys = LinkInfo::default();
        assert!(!phys.is_veth());
    }
}
