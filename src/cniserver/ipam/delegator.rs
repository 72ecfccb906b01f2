// Delegation to external CNI-conformant IPAM plugin binaries.
//
// The subprocess boundary is the CNI convention and must match it byte for
// byte: CNI_* environment variables, the network configuration on stdin, a
// result or error JSON on stdout. Plugin diagnostics are propagated verbatim
// so operators see the plugin's own message, never a wrapped copy.

use crate::cniserver::error::CniError;
use crate::cniserver::ipam::{IpamDriver, PluginArgs};
use crate::cniserver::types::{CniResult, IpamResult, K8sArgs};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// IPAM type name that selects delegation to the standard host-local plugin.
pub const IPAM_HOST_LOCAL: &str = "host-local";

const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Capability interface over plugin invocation. The production
/// implementation spawns the binary; tests substitute a scripted one.
#[async_trait]
pub trait IpamExecutor: Send + Sync {
    /// ADD execution path: run the plugin and parse its result.
    async fn exec_with_result(
        &self,
        plugin_type: &str,
        netconf: &[u8],
        args: &PluginArgs,
    ) -> Result<CniResult, CniError>;

    /// DEL/CHECK execution path: run the plugin, no result expected.
    async fn exec_no_result(
        &self,
        command: &str,
        plugin_type: &str,
        netconf: &[u8],
        args: &PluginArgs,
    ) -> Result<(), CniError>;
}

/// Error JSON a failing plugin prints on stdout, per the CNI convention.
#[derive(Debug, Deserialize)]
struct PluginError {
    #[allow(dead_code)]
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

impl PluginError {
    fn into_message(self) -> String {
        if self.details.is_empty() {
            self.msg
        } else {
            format!("{}; {}", self.msg, self.details)
        }
    }
}

/// Spawns IPAM plugin binaries found on the request-supplied search path.
/// Execution is bounded: on timeout the child is killed and the attempt
/// fails, so no allocation is left half-applied.
pub struct PluginRunner {
    timeout: Duration,
}

impl PluginRunner {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PLUGIN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn find_plugin(plugin_type: &str, search_path: &str) -> Option<PathBuf> {
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            let candidate = PathBuf::from(dir).join(plugin_type);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    async fn run(
        &self,
        command: &str,
        plugin_type: &str,
        netconf: &[u8],
        args: &PluginArgs,
    ) -> Result<Vec<u8>, CniError> {
        let binary = Self::find_plugin(plugin_type, &args.path).ok_or_else(|| {
            CniError::Delegate(format!(
                "failed to find plugin \"{}\" in path [{}]",
                plugin_type, args.path
            ))
        })?;

        let mut child = tokio::process::Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_ARGS", &args.args)
            .env("CNI_PATH", &args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CniError::Delegate(format!("failed to exec {}: {}", binary.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(netconf).await.map_err(|e| {
                CniError::Delegate(format!("failed to write netconf to {}: {}", plugin_type, e))
            })?;
            // Close stdin so the plugin sees EOF
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CniError::Delegate(format!(
                    "plugin {} failed: {}",
                    plugin_type, e
                )))
            }
            // Dropping the in-flight future kills the child (kill_on_drop)
            Err(_) => {
                return Err(CniError::Delegate(format!(
                    "plugin {} timed out after {:?}",
                    plugin_type, self.timeout
                )))
            }
        };

        if !output.status.success() {
            // A well-behaved plugin prints CNI error JSON on stdout
            if let Ok(err) = serde_json::from_slice::<PluginError>(&output.stdout) {
                if !err.msg.is_empty() {
                    return Err(CniError::Delegate(err.into_message()));
                }
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CniError::Delegate(format!(
                "plugin {} exited with {}: {}",
                plugin_type,
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl Default for PluginRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpamExecutor for PluginRunner {
    async fn exec_with_result(
        &self,
        plugin_type: &str,
        netconf: &[u8],
        args: &PluginArgs,
    ) -> Result<CniResult, CniError> {
        let stdout = self.run("ADD", plugin_type, netconf, args).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            CniError::Delegate(format!("plugin {} returned invalid result: {}", plugin_type, e))
        })
    }

    async fn exec_no_result(
        &self,
        command: &str,
        plugin_type: &str,
        netconf: &[u8],
        args: &PluginArgs,
    ) -> Result<(), CniError> {
        self.run(command, plugin_type, netconf, args).await?;
        Ok(())
    }
}

/// Driver that satisfies IPAM by shelling out to an external plugin binary.
pub struct IpamDelegator {
    plugin_type: String,
    exec: Arc<dyn IpamExecutor>,
}

impl IpamDelegator {
    pub fn new(plugin_type: &str, exec: Arc<dyn IpamExecutor>) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            exec,
        }
    }
}

#[async_trait]
impl IpamDriver for IpamDelegator {
    async fn add(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<Option<IpamResult>, CniError> {
        let result = self
            .exec
            .exec_with_result(&self.plugin_type, netconf, args)
            .await?;
        Ok(Some(IpamResult { result, vlan_id: 0 }))
    }

    async fn del(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<bool, CniError> {
        self.exec
            .exec_no_result("DEL", &self.plugin_type, netconf, args)
            .await?;
        Ok(true)
    }

    async fn check(
        &self,
        args: &PluginArgs,
        _k8s: &K8sArgs,
        netconf: &[u8],
    ) -> Result<bool, CniError> {
        self.exec
            .exec_no_result("CHECK", &self.plugin_type, netconf, args)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cniserver::ipam::testing::ScriptedExecutor;

    fn plugin_args() -> PluginArgs {
        PluginArgs {
            container_id: "container-id".to_string(),
            netns: "/proc/42/ns/net".to_string(),
            ifname: "eth0".to_string(),
            args: String::new(),
            path: "/opt/cni/bin".to_string(),
        }
    }

    const NETCONF: &[u8] = br#"{"cniVersion":"0.4.0","name":"pod-net","type":"weft"}"#;

    #[tokio::test]
    async fn add_returns_plugin_result() {
        let exec = Arc::new(ScriptedExecutor::ok("0.4.0"));
        let delegator = IpamDelegator::new(IPAM_HOST_LOCAL, exec);
        let res = delegator
            .add(&plugin_args(), &K8sArgs::default(), NETCONF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.result.cni_version, "0.4.0");
        assert_eq!(res.vlan_id, 0);
    }

    #[tokio::test]
    async fn add_propagates_plugin_error_verbatim() {
        let exec = Arc::new(ScriptedExecutor::failing("no IP addresses available in range set"));
        let delegator = IpamDelegator::new(IPAM_HOST_LOCAL, exec);
        let err = delegator
            .add(&plugin_args(), &K8sArgs::default(), NETCONF)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no IP addresses available in range set");
    }

    #[tokio::test]
    async fn del_and_check_use_no_result_path() {
        let exec = Arc::new(ScriptedExecutor::ok("0.4.0"));
        let delegator = IpamDelegator::new(IPAM_HOST_LOCAL, exec.clone());
        assert!(delegator
            .del(&plugin_args(), &K8sArgs::default(), NETCONF)
            .await
            .unwrap());
        assert!(delegator
            .check(&plugin_args(), &K8sArgs::default(), NETCONF)
            .await
            .unwrap());
        assert_eq!(exec.commands(), vec!["DEL".to_string(), "CHECK".to_string()]);
    }

    fn write_plugin_script(dir: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn script_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("weft-delegate-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn runs_a_real_plugin_over_the_cni_contract() {
        let dir = script_dir("ok");
        // The script proves env + stdin handling: it echoes a result carrying
        // the CNI_IFNAME it saw
        write_plugin_script(
            &dir,
            "host-local",
            r#"cat > /dev/null; printf '{"cniVersion":"0.4.0","ips":[],"interfaces":[{"name":"'"$CNI_IFNAME"'"}]}'"#,
        );

        let runner = PluginRunner::new();
        let mut args = plugin_args();
        args.path = dir.display().to_string();

        let result = runner
            .exec_with_result("host-local", NETCONF, &args)
            .await
            .unwrap();
        assert_eq!(result.cni_version, "0.4.0");
        assert_eq!(result.interfaces[0].name, "eth0");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn surfaces_plugin_error_json_verbatim() {
        let dir = script_dir("err");
        write_plugin_script(
            &dir,
            "host-local",
            r#"cat > /dev/null; printf '{"code":11,"msg":"no IP addresses available in range set","details":"RangeSet: 10.42.0.2-10.42.0.254"}'; exit 1"#,
        );

        let runner = PluginRunner::new();
        let mut args = plugin_args();
        args.path = dir.display().to_string();

        let err = runner
            .exec_no_result("DEL", "host-local", NETCONF, &args)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no IP addresses available in range set; RangeSet: 10.42.0.2-10.42.0.254"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn timeout_bounds_plugin_execution() {
        let dir = script_dir("slow");
        write_plugin_script(&dir, "host-local", "cat > /dev/null; sleep 30");

        let runner = PluginRunner::with_timeout(std::time::Duration::from_millis(200));
        let mut args = plugin_args();
        args.path = dir.display().to_string();

        let err = runner
            .exec_with_result("host-local", NETCONF, &args)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn plugin_lookup_scans_path_entries() {
        let dir = std::env::temp_dir().join(format!("weft-plugins-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("host-local"), b"#!/bin/sh\n").unwrap();

        let path = format!("/nonexistent:{}", dir.display());
        let found = PluginRunner::find_plugin("host-local", &path).unwrap();
        assert_eq!(found, dir.join("host-local"));
        assert!(PluginRunner::find_plugin("dhcp", &path).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
