// Request payload and result types for the CNI protocol.
// The JSON shapes follow the CNI spec so delegated plugins and the shim can
// consume them unmodified.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// CNI spec versions this agent accepts in a network configuration.
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// Network configuration as handed to the shim by the runtime. Only the
/// fields the agent itself interprets are modeled; the raw bytes are passed
/// through unchanged to delegated IPAM plugins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub ipam: Option<IpamConfig>,
    /// PCI address of an SR-IOV virtual function. Presence selects the
    /// VF-representor attachment mode; absence selects veth.
    #[serde(rename = "deviceID", default)]
    pub device_id: Option<String>,
    /// Result of a previous ADD, present on CHECK/DEL requests.
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<CniResult>,
}

impl NetworkConfig {
    pub fn ipam_type(&self) -> &str {
        self.ipam
            .as_ref()
            .map(|i| i.ipam_type.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IpamConfig {
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub vlan: Option<u16>,
}

/// CNI result, the wire shape returned to the shim and cached per request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Interface {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path the interface lives in; absent for host-side links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    pub address: ipnet::IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Route {
    pub dst: ipnet::IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// An IPAM driver's answer: the CNI-shaped allocation plus the attachment
/// tag the dataplane needs (VLAN id for pool-backed allocations).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpamResult {
    pub result: CniResult,
    pub vlan_id: u16,
}

/// A fully-parsed lifecycle request. Built once per incoming event and
/// treated as immutable for the duration of handling.
#[derive(Debug, Clone)]
pub struct AttachmentRequest {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    /// Raw configuration bytes, passed through unchanged to delegated IPAM.
    pub netconf_bytes: Vec<u8>,
    pub netconf: NetworkConfig,
    pub k8s: K8sArgs,
}

/// Kubernetes bookkeeping arguments carried in the request `args` string,
/// `K8S_POD_NAMESPACE=..;K8S_POD_NAME=..;K8S_POD_INFRA_CONTAINER_ID=..`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct K8sArgs {
    pub pod_namespace: String,
    pub pod_name: String,
    pub infra_container_id: String,
}

impl K8sArgs {
    pub fn parse(args: &str) -> Self {
        let mut parsed = K8sArgs::default();
        for pair in args.split(';') {
            let Ok((key, value)) = crate::utils::validation::InputValidator::parse_key_val(pair)
            else {
                continue;
            };
            match key.as_str() {
                "K8S_POD_NAMESPACE" => parsed.pod_namespace = value,
                "K8S_POD_NAME" => parsed.pod_name = value,
                "K8S_POD_INFRA_CONTAINER_ID" => parsed.infra_container_id = value,
                _ => {}
            }
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_k8s_args() {
        let args = K8sArgs::parse(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=kube-system;K8S_POD_NAME=coredns-abc;K8S_POD_INFRA_CONTAINER_ID=deadbeef",
        );
        assert_eq!(args.pod_namespace, "kube-system");
        assert_eq!(args.pod_name, "coredns-abc");
        assert_eq!(args.infra_container_id, "deadbeef");
    }

    #[test]
    fn empty_args_parse_to_defaults() {
        assert_eq!(K8sArgs::parse(""), K8sArgs::default());
    }

    #[test]
    fn network_config_parses_minimal_payload() {
        let conf: NetworkConfig = serde_json::from_str(
            r#"{"cniVersion":"0.4.0","name":"pod-net","type":"weft","ipam":{"type":"host-local","subnet":"10.42.0.0/24"}}"#,
        )
        .unwrap();
        assert_eq!(conf.cni_version, "0.4.0");
        assert_eq!(conf.ipam_type(), "host-local");
        assert!(conf.device_id.is_none());
        assert!(conf.mtu.is_none());
    }

    #[test]
    fn cni_result_round_trips_through_json() {
        let result: CniResult = serde_json::from_str(
            r#"{
                "cniVersion": "0.4.0",
                "interfaces": [
                    {"name": "eth0", "mac": "aa:bb:cc:dd:ee:ff", "sandbox": "/proc/42/ns/net"},
                    {"name": "weft-0a1b2c3d4e"}
                ],
                "ips": [{"version": "4", "interface": 0, "address": "10.42.0.5/24", "gateway": "10.42.0.1"}]
            }"#,
        )
        .unwrap();
        assert_eq!(result.interfaces.len(), 2);
        assert_eq!(result.interfaces[0].sandbox.as_deref(), Some("/proc/42/ns/net"));
        assert!(result.interfaces[1].sandbox.is_none());
        assert_eq!(result.ips[0].address.to_string(), "10.42.0.5/24");

        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: CniResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, result);
    }
}
