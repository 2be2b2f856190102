//! Translation of per-pod runtime options into plugin invocation inputs.
//!
//! Every populated [`RuntimeConfig`] field becomes either an ordered CNI
//! argument (forwarded via `CNI_ARGS`) or a capability argument (injected
//! into the plugin's `runtimeConfig`). Validation happens here, before any
//! plugin is invoked.

use crate::constants::{
    ARG_IGNORE_UNKNOWN, ARG_IP, ARG_MAC, ARG_POD_INFRA_CONTAINER_ID, ARG_POD_NAME,
    ARG_POD_NAMESPACE, ARG_POD_UID, CAP_ALIASES, CAP_BANDWIDTH, CAP_CGROUP_PATH, CAP_DNS,
    CAP_IP_RANGES, CAP_PORT_MAPPINGS,
};
use crate::error::{Error, Result};
use crate::types::{PodNetwork, RuntimeConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

/// Fully assembled invocation inputs for one attachment.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConf {
    /// Sandbox container ID.
    pub container_id: String,
    /// Network namespace path.
    pub netns: String,
    /// Interface name inside the namespace.
    pub ifname: String,
    /// Ordered `key=value` argument pairs, forwarded via `CNI_ARGS`.
    pub args: Vec<(String, String)>,
    /// Capability name to structured value, filtered per plugin declaration.
    pub capability_args: HashMap<String, Value>,
}

/// Builds the invocation inputs for `(pod, ifname)` with optional per-network
/// runtime options.
///
/// Argument order is fixed: `IgnoreUnknown`, the four pod identity keys, then
/// `IP` and `MAC` when requested. Invalid `ip`/`mac` values fail here so no
/// plugin ever runs with a malformed request. Empty collections are dropped
/// entirely rather than forwarded as empty.
pub fn build_runtime_conf(
    pod: &PodNetwork,
    ifname: &str,
    runtime: Option<&RuntimeConfig>,
) -> Result<RuntimeConf> {
    let mut args = vec![
        (ARG_IGNORE_UNKNOWN.to_string(), "1".to_string()),
        (ARG_POD_NAMESPACE.to_string(), pod.namespace.clone()),
        (ARG_POD_NAME.to_string(), pod.name.clone()),
        (ARG_POD_INFRA_CONTAINER_ID.to_string(), pod.id.clone()),
        (ARG_POD_UID.to_string(), pod.uid.clone()),
    ];
    let mut capability_args = HashMap::new();

    if let Some(runtime) = runtime {
        if let Some(ip) = &runtime.ip {
            ip.parse::<IpAddr>()
                .map_err(|_| Error::InvalidIp(ip.clone()))?;
            args.push((ARG_IP.to_string(), ip.clone()));
        }

        if let Some(mac) = &runtime.mac {
            validate_mac(mac)?;
            args.push((ARG_MAC.to_string(), mac.clone()));
        }

        if !runtime.port_mappings.is_empty() {
            capability_args.insert(
                CAP_PORT_MAPPINGS.to_string(),
                serde_json::to_value(&runtime.port_mappings)?,
            );
        }

        if let Some(bandwidth) = &runtime.bandwidth {
            capability_args.insert(CAP_BANDWIDTH.to_string(), serde_json::to_value(bandwidth)?);
        }

        if !runtime.ip_ranges.is_empty() {
            capability_args.insert(
                CAP_IP_RANGES.to_string(),
                serde_json::to_value(&runtime.ip_ranges)?,
            );
        }

        if let Some(cgroup_path) = &runtime.cgroup_path {
            capability_args.insert(CAP_CGROUP_PATH.to_string(), Value::String(cgroup_path.clone()));
        }

        if let Some(dns) = &runtime.dns {
            capability_args.insert(CAP_DNS.to_string(), serde_json::to_value(dns)?);
        }
    }

    if !pod.aliases.is_empty() {
        capability_args.insert(CAP_ALIASES.to_string(), serde_json::to_value(&pod.aliases)?);
    }

    Ok(RuntimeConf {
        container_id: pod.id.clone(),
        netns: pod.netns.clone(),
        ifname: ifname.to_string(),
        args,
        capability_args,
    })
}

/// Accepts a 6-byte hardware address in colon or dash notation.
fn validate_mac(mac: &str) -> Result<()> {
    let sep = if mac.contains('-') { '-' } else { ':' };
    let octets: Vec<&str> = mac.split(sep).collect();
    if octets.len() != 6 {
        return Err(Error::InvalidMac(mac.to_string()));
    }
    for octet in octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidMac(mac.to_string()));
        }
    }
    Ok(())
}
