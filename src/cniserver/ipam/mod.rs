// IPAM driver registry, result cache and execution entry points.
//
// The registry is an explicit object constructed once at agent startup and
// shared by Arc; registration happens during startup, lookups happen on
// every request, so the table sits behind a read/write lock and execution
// clones the driver list out so no lock is ever held across an await.

pub mod delegator;
pub mod pool;

use crate::cniserver::error::CniError;
use crate::cniserver::types::{IpamResult, K8sArgs};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Distinguished IPAM type name of the in-process pool driver.
pub const BUILTIN_IPAM_TYPE: &str = "weft";

/// Request identity handed to drivers, mirroring the CNI invocation contract
/// (environment of a directly-executed plugin).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
}

/// Cache key for one pod interface. DEL and CHECK re-derive it from the
/// request alone, so no external state is needed to find the entry.
pub fn result_key(container_id: &str, ifname: &str) -> String {
    format!("{}/{}", container_id, ifname)
}

/// One registered IPAM driver. `add` returns None when the request is not
/// this driver's to serve (other pools registered under the same type get
/// their turn); `del`/`check` return a handled flag the same way.
#[async_trait]
pub trait IpamDriver: Send + Sync {
    async fn add(
        &self,
        args: &PluginArgs,
        k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<Option<IpamResult>, CniError>;

    async fn del(&self, args: &PluginArgs, k8s: &K8sArgs, netconf: &[u8])
        -> Result<bool, CniError>;

    async fn check(
        &self,
        args: &PluginArgs,
        k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<bool, CniError>;
}

pub struct IpamRegistry {
    drivers: RwLock<HashMap<String, Vec<Arc<dyn IpamDriver>>>>,
    /// Most recent allocation per result key; makes retried ADDs and
    /// repeated DELs idempotent.
    results: DashMap<String, IpamResult>,
}

impl IpamRegistry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            results: DashMap::new(),
        }
    }

    /// Append a driver under the type name. Registering the same type twice
    /// is supported: each call adds another pool to the chain.
    pub fn register(&self, ipam_type: &str, driver: Arc<dyn IpamDriver>) {
        self.drivers
            .write()
            .entry(ipam_type.to_string())
            .or_default()
            .push(driver);
    }

    pub fn is_type_registered(&self, ipam_type: &str) -> bool {
        self.drivers.read().contains_key(ipam_type)
    }

    fn drivers_for(&self, ipam_type: &str) -> Vec<Arc<dyn IpamDriver>> {
        self.drivers
            .read()
            .get(ipam_type)
            .cloned()
            .unwrap_or_default()
    }

    // ── Result cache ──────────────────────────────────────────────────

    pub fn store_result(&self, key: &str, result: IpamResult) {
        self.results.insert(key.to_string(), result);
    }

    pub fn load_result(&self, key: &str) -> Option<IpamResult> {
        self.results.get(key).map(|r| r.clone())
    }

    pub fn forget_result(&self, key: &str) -> Option<IpamResult> {
        self.results.remove(key).map(|(_, r)| r)
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Obtain an allocation for the request. A cached result is returned
    /// as-is so a retried ADD after a partial failure does not allocate a
    /// second address.
    pub async fn exec_add(
        &self,
        ipam_type: &str,
        args: &PluginArgs,
        k8s: &K8sArgs,
        netconf: &[u8],
        key: &str,
    ) -> Result<IpamResult, CniError> {
        if let Some(cached) = self.load_result(key) {
            tracing::debug!("IPAM result for {} served from cache", key);
            return Ok(cached);
        }

        let drivers = self.drivers_for(ipam_type);
        if drivers.is_empty() {
            return Err(CniError::DriverNotFound);
        }

        for driver in drivers {
            if let Some(result) = driver.add(args, k8s, netconf).await? {
                self.store_result(key, result.clone());
                return Ok(result);
            }
        }
        // Every pool declined the request
        Err(CniError::DriverNotFound)
    }

    /// Release the allocation. A missing cache entry is not an error: DEL
    /// must be safe to call any number of times.
    pub async fn exec_del(
        &self,
        ipam_type: &str,
        args: &PluginArgs,
        k8s: &K8sArgs,
        netconf: &[u8],
        key: &str,
    ) -> Result<(), CniError> {
        let drivers = self.drivers_for(ipam_type);
        if drivers.is_empty() {
            return Err(CniError::DriverNotFound);
        }

        for driver in drivers {
            if driver.del(args, k8s, netconf).await? {
                break;
            }
        }

        self.forget_result(key);
        Ok(())
    }

    pub async fn exec_check(
        &self,
        ipam_type: &str,
        args: &PluginArgs,
        k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<(), CniError> {
        let drivers = self.drivers_for(ipam_type);
        if drivers.is_empty() {
            return Err(CniError::DriverNotFound);
        }

        for driver in drivers {
            if driver.check(args, k8s, netconf).await? {
                return Ok(());
            }
        }
        Err(CniError::DriverNotFound)
    }
}

impl Default for IpamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
