// Managed vswitch bridge boundary.
// The agent only attaches host-side links and hands (name, port id) over;
// flow programming on the bridge belongs to the dataplane controller.

use crate::network::error::LinkResult;
use crate::network::netlink::{LinkInfo, LinkInspector};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub struct BridgeManager {
    name: String,
    links: Arc<dyn LinkInspector>,
    /// Cached bridge ifindex
    index: AtomicU32,
    /// Registered ports, host interface name -> port id
    ports: DashMap<String, Uuid>,
}

impl BridgeManager {
    pub fn new(name: &str, links: Arc<dyn LinkInspector>) -> Self {
        Self {
            name: name.to_string(),
            links,
            index: AtomicU32::new(0),
            ports: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensure the bridge exists and is up. Call once at startup.
    pub async fn ensure_ready(&self) -> LinkResult<u32> {
        let idx = self.links.create_bridge(&self.name).await?;
        self.links.set_link_up(idx).await?;
        self.index.store(idx, Ordering::Relaxed);
        tracing::info!("Bridge {} ready (ifindex {})", self.name, idx);
        Ok(idx)
    }

    async fn bridge_index(&self) -> LinkResult<u32> {
        let cached = self.index.load(Ordering::Relaxed);
        if cached > 0 {
            return Ok(cached);
        }
        let idx = self.links.link_by_name(&self.name).await?.index;
        self.index.store(idx, Ordering::Relaxed);
        Ok(idx)
    }

    /// Attach a host-side link as a bridge port and record its port id for
    /// the dataplane controller.
    pub async fn register_port(&self, link: &LinkInfo) -> LinkResult<Uuid> {
        let bridge_idx = self.bridge_index().await?;
        self.links.set_link_master(link.index, bridge_idx).await?;
        self.links.set_link_up(link.index).await?;

        let port_id = port_id_for(&link.name);
        self.ports.insert(link.name.clone(), port_id);
        tracing::info!("Port {} registered on {} as {}", link.name, self.name, port_id);
        Ok(port_id)
    }

    /// Forget a port. The kernel detaches the port automatically when the
    /// veth is deleted, so an unknown name is success.
    pub fn unregister_port(&self, name: &str) -> Option<Uuid> {
        let removed = self.ports.remove(name).map(|(_, id)| id);
        if removed.is_some() {
            tracing::info!("Port {} unregistered from {}", name, self.name);
        }
        removed
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

/// Deterministic port id so DEL can re-derive it without stored state.
pub fn port_id_for(host_ifname: &str) -> Uuid {
    let digest = Sha256::digest(host_ifname.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::netlink::testing::MockLinkInspector;

    #[test]
    fn port_ids_are_deterministic() {
        assert_eq!(port_id_for("weft-0a1b2c3d4e"), port_id_for("weft-0a1b2c3d4e"));
        assert_ne!(port_id_for("weft-0a1b2c3d4e"), port_id_for("weft-aaaaaaaaaa"));
    }

    #[tokio::test]
    async fn register_and_unregister_ports() {
        let links = Arc::new(MockLinkInspector::new());
        let bridge = BridgeManager::new("weft0", links.clone());
        bridge.ensure_ready().await.unwrap();

        let (host, _) = links
            .create_veth_pair("weft-0a1b2c3d4e", "wefp-0a1b2c3d4e")
            .await
            .unwrap();

        let port_id = bridge.register_port(&host).await.unwrap();
        assert_eq!(port_id, port_id_for("weft-0a1b2c3d4e"));
        assert_eq!(bridge.port_count(), 1);

        assert_eq!(bridge.unregister_port("weft-0a1b2c3d4e"), Some(port_id));
        assert_eq!(bridge.port_count(), 0);
        // Unknown names are success
        assert_eq!(bridge.unregister_port("weft-0a1b2c3d4e"), None);
    }
}
