// In-process IPAM: carve addresses out of a node-local IPv4 pool.
//
// Registered under the distinguished "weft" type through the same registry
// as delegated drivers, so dispatch is uniform. Allocation chooses the
// lowest free address by scanning from the pool base, which keeps the
// behavior rigid and predictable across restarts of the same workload set.

use crate::cniserver::error::CniError;
use crate::cniserver::ipam::{result_key, IpamDriver, PluginArgs};
use crate::cniserver::types::{CniResult, IpConfig, IpamResult, K8sArgs, NetworkConfig, Route};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug)]
pub struct NodeIpamPool {
    pool_name: String,
    subnet: Ipv4Net,
    /// Network base + 1, also the default-route gateway handed to pods.
    gateway: Ipv4Addr,
    vlan_id: u16,
    /// result key -> allocated address
    allocations: Mutex<HashMap<String, Ipv4Addr>>,
}

impl NodeIpamPool {
    pub fn new(pool_name: &str, pod_cidr: &str, vlan_id: u16) -> Result<Self, CniError> {
        let subnet: Ipv4Net = pod_cidr
            .parse()
            .map_err(|e| CniError::InvalidConfig(format!("invalid pool CIDR {}: {}", pod_cidr, e)))?;
        if !(16..=30).contains(&subnet.prefix_len()) {
            return Err(CniError::InvalidConfig(format!(
                "invalid pool CIDR prefix /{} (expected /16 to /30)",
                subnet.prefix_len()
            )));
        }

        // We require the CIDR base to be the network address for sanity.
        let base = u32::from(subnet.addr());
        if base != u32::from(subnet.network()) {
            return Err(CniError::InvalidConfig(format!(
                "pool CIDR must be a network base address, got {}",
                pod_cidr
            )));
        }

        let gateway = Ipv4Addr::from(base + 1);
        Ok(Self {
            pool_name: pool_name.to_string(),
            subnet,
            gateway,
            vlan_id,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// True when this pool serves the request: either the configuration
    /// names no subnet, or it names ours. Lets several pools share the
    /// registry type.
    fn claims(&self, conf: &NetworkConfig) -> bool {
        match conf.ipam.as_ref().and_then(|i| i.subnet.as_deref()) {
            None => true,
            Some(subnet) => subnet
                .parse::<Ipv4Net>()
                .map(|net| net == self.subnet)
                .unwrap_or(false),
        }
    }

    /// Lowest free address, scanning from base+2 (base is the network
    /// address, base+1 the gateway). Re-requesting a held key returns the
    /// existing allocation.
    fn allocate(&self, key: &str) -> Result<Ipv4Addr, CniError> {
        let mut allocations = self.allocations.lock();
        if let Some(existing) = allocations.get(key) {
            return Ok(*existing);
        }

        let base = u32::from(self.subnet.network());
        let size = 1u64 << (32 - self.subnet.prefix_len());
        // Last offset is the broadcast address
        for offset in 2..size.saturating_sub(1) {
            let candidate = Ipv4Addr::from(base + offset as u32);
            if allocations.values().any(|a| *a == candidate) {
                continue;
            }
            allocations.insert(key.to_string(), candidate);
            return Ok(candidate);
        }

        Err(CniError::PoolExhausted {
            pool: self.pool_name.clone(),
        })
    }

    fn release(&self, key: &str) -> Option<Ipv4Addr> {
        self.allocations.lock().remove(key)
    }

    fn holds(&self, key: &str) -> bool {
        self.allocations.lock().contains_key(key)
    }

    fn build_result(&self, cni_version: &str, ip: Ipv4Addr) -> Result<CniResult, CniError> {
        let address = Ipv4Net::new(ip, self.subnet.prefix_len())
            .map_err(|e| CniError::InvalidConfig(format!("bad allocation {}: {}", ip, e)))?;
        let default_dst = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|e| CniError::InvalidConfig(format!("bad default route: {}", e)))?;

        Ok(CniResult {
            cni_version: cni_version.to_string(),
            interfaces: Vec::new(),
            ips: vec![IpConfig {
                version: Some("4".to_string()),
                interface: None,
                address: IpNet::V4(address),
                gateway: Some(IpAddr::V4(self.gateway)),
            }],
            routes: vec![Route {
                dst: IpNet::V4(default_dst),
                gw: Some(IpAddr::V4(self.gateway)),
            }],
            dns: Default::default(),
        })
    }

    fn parse_conf(netconf: &[u8]) -> Result<NetworkConfig, CniError> {
        serde_json::from_slice(netconf)
            .map_err(|e| CniError::InvalidConfig(format!("unparseable network config: {}", e)))
    }
}

#[async_trait]
impl IpamDriver for NodeIpamPool {
    async fn add(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<Option<IpamResult>, CniError> {
        let conf = Self::parse_conf(netconf)?;
        if !self.claims(&conf) {
            return Ok(None);
        }

        let key = result_key(&args.container_id, &args.ifname);
        let ip = self.allocate(&key)?;
        tracing::info!("Pool {} allocated {} for {}", self.pool_name, ip, key);

        Ok(Some(IpamResult {
            result: self.build_result(&conf.cni_version, ip)?,
            vlan_id: self.vlan_id,
        }))
    }

    async fn del(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<bool, CniError> {
        let conf = Self::parse_conf(netconf)?;
        if !self.claims(&conf) {
            return Ok(false);
        }

        let key = result_key(&args.container_id, &args.ifname);
        if let Some(ip) = self.release(&key) {
            tracing::info!("Pool {} released {} for {}", self.pool_name, ip, key);
        }
        // Never held is fine: the end state is what DEL asked for
        Ok(true)
    }

    async fn check(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<bool, CniError> {
        let conf = Self::parse_conf(netconf)?;
        if !self.claims(&conf) {
            return Ok(false);
        }

        let key = result_key(&args.container_id, &args.ifname);
        if self.holds(&key) {
            Ok(true)
        } else {
            Err(CniError::ResultNotCached(key))
        }
    }
}
