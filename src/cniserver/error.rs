use crate::network::error::LinkError;

/// Errors surfaced to the CNI shim. Display strings for the validation and
/// registry variants are part of the operator-facing contract and must not
/// change: existing tooling matches on them.
#[derive(Debug, thiserror::Error)]
pub enum CniError {
    // ── Request/configuration errors ──────────────────────────────────
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid request arguments: {0}")]
    InvalidArgs(String),
    #[error("unsupported CNI version {0}")]
    IncompatibleVersion(String),

    // ── Interface validation (topology mismatch) ──────────────────────
    #[error("interface name is missing")]
    MissingName,
    #[error("interface {0} is expected in netns")]
    ExpectedInNetns(String),
    #[error("interface {0} is expected not in netns")]
    ExpectedNotInNetns(String),
    #[error("failed to find link for interface {0}")]
    LinkNotFound(String),
    #[error("unknown device type {0}")]
    UnknownDeviceType(String),
    #[error("peer veth interface not found for container interface {0}")]
    PeerNotFound(String),

    // ── SR-IOV resolution, one error per step so operators can tell a
    //    broken uplink from a missing VF binding ───────────────────────
    #[error("failed to get uplink representor for PCI Address {0}")]
    UplinkRepresentorNotFound(String),
    #[error("failed to get VF index for PCI Address {0}")]
    VfIndexNotFound(String),
    #[error("failed to get VF representor for uplink {uplink} VF {vf_index}")]
    VfRepresentorNotFound { uplink: String, vf_index: u32 },

    // ── IPAM ──────────────────────────────────────────────────────────
    // Verbatim legacy string, matched by existing tooling
    #[error("No suitable IPAM driver found")]
    DriverNotFound,
    #[error("no IPAM result cached for {0}")]
    ResultNotCached(String),
    #[error("IPAM pool {pool} exhausted")]
    PoolExhausted { pool: String },

    // ── Delegated plugin failures, propagated with the plugin's own
    //    diagnostic untouched ──────────────────────────────────────────
    #[error("{0}")]
    Delegate(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}
