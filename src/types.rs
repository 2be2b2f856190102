//! Pod-facing data types and the lenient view of plugin results.
//!
//! `PodNetwork` is the runtime's description of one pod sandbox; everything
//! else here either feeds plugin invocations (`RuntimeConfig` and friends) or
//! decodes what plugins hand back. Result decoding is deliberately lenient:
//! only the fields needed to extract IPs and interfaces are modeled, the raw
//! document is carried alongside untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// =============================================================================
// Pod Description
// =============================================================================

/// The runtime's description of one pod sandbox.
///
/// `id` is the sandbox container ID; it keys both the per-pod lock table and
/// the on-disk attachment cache. An empty `netns` denotes a host-network pod,
/// which skips loopback configuration.
#[derive(Debug, Clone, Default)]
pub struct PodNetwork {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Sandbox container ID (ownership key).
    pub id: String,
    /// Pod UID.
    pub uid: String,
    /// Path to the pod's network namespace.
    pub netns: String,
    /// Explicit attachment list; empty means "attach the default network".
    pub networks: Vec<NetAttachment>,
    /// Per-network runtime options, keyed by network name.
    pub runtime_config: HashMap<String, RuntimeConfig>,
    /// Per-network interface aliases, keyed by network name.
    pub aliases: HashMap<String, Vec<String>>,
}

/// One requested `(network, interface)` pairing.
///
/// When `ifname` is `None` the engine assigns `eth{i}` by position in the
/// attachment list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetAttachment {
    /// Logical network name.
    pub name: String,
    /// Requested interface name inside the pod namespace.
    pub ifname: Option<String>,
}

impl NetAttachment {
    /// Creates an attachment with a defaulted interface name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ifname: None,
        }
    }

    /// Creates an attachment with an explicit interface name.
    pub fn with_ifname(name: impl Into<String>, ifname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ifname: Some(ifname.into()),
        }
    }
}

// =============================================================================
// Per-Network Runtime Options
// =============================================================================

/// Optional per-network runtime options supplied by the caller.
///
/// Each populated field maps to either a CNI argument (`ip`, `mac`) or a
/// capability argument. Empty collections are dropped, not forwarded.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Requested IP address (v4 or v6).
    pub ip: Option<String>,
    /// Requested MAC address.
    pub mac: Option<String>,
    /// Host-to-container port mappings.
    pub port_mappings: Vec<PortMapping>,
    /// Ingress/egress bandwidth shaping.
    pub bandwidth: Option<BandwidthConfig>,
    /// IP ranges the attachment may allocate from.
    pub ip_ranges: Vec<Vec<IpRange>>,
    /// Cgroup path of the pod.
    pub cgroup_path: Option<String>,
    /// DNS settings for the attachment.
    pub dns: Option<CniDns>,
}

/// One forwarded port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: i32,
    /// Port inside the container.
    pub container_port: i32,
    /// Protocol (`tcp`, `udp`, `sctp`).
    pub protocol: String,
    /// Host IP to bind, if restricted.
    #[serde(rename = "hostIP", skip_serializing_if = "String::is_empty", default)]
    pub host_ip: String,
}

/// Bandwidth shaping parameters, all non-negative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthConfig {
    /// Ingress rate in bits/s.
    pub ingress_rate: u64,
    /// Ingress burst in bits.
    pub ingress_burst: u64,
    /// Egress rate in bits/s.
    pub egress_rate: u64,
    /// Egress burst in bits.
    pub egress_burst: u64,
}

/// One allocatable IP range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    /// Subnet in CIDR notation.
    pub subnet: String,
    /// First address of the range.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub range_start: String,
    /// Last address of the range.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub range_end: String,
    /// Gateway for the range.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub gateway: String,
}

// =============================================================================
// Attachment Results
// =============================================================================

/// The outcome of one attachment: which network, which interface, and the raw
/// chain result exactly as the final plugin produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetResult {
    /// Network the attachment belongs to.
    pub name: String,
    /// Interface name assigned inside the pod namespace.
    pub ifname: String,
    /// Raw plugin chain result document.
    pub result: Value,
}

/// Lenient typed view of a plugin result document.
///
/// Used only to extract IPs and interfaces; unknown fields are ignored and
/// never round-tripped through this type.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI spec version of the result.
    #[serde(default)]
    pub cni_version: String,
    /// Interfaces created by the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<CniInterface>>,
    /// IP configurations assigned by the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<CniIpConfig>>,
    /// Routes configured by the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<CniRoute>>,
    /// DNS configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<CniDns>,
}

impl CniResult {
    /// Parses the typed view out of a raw result document.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// One interface reported by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,
    /// MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path for in-sandbox interfaces; absent for host interfaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// One IP assignment reported by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniIpConfig {
    /// Index into `interfaces` this address belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Address with prefix length.
    pub address: String,
    /// Gateway for the address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// One route reported by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRoute {
    /// Destination CIDR.
    pub dst: String,
    /// Gateway for the route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// DNS settings, both as capability input and as result output.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CniDns {
    /// Nameserver addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// Local domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Search domains.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// Resolver options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}
