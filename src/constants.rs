//! Constants for the CNI orchestration layer.
//!
//! All limits, timeouts, paths, and protocol keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Default Directories
// =============================================================================

/// Default directory holding network configuration files.
pub const DEFAULT_CONF_DIR: &str = "/etc/cni/net.d";

/// Default directory searched for plugin binaries.
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

/// Default directory for on-disk attachment records.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni";

/// Subdirectory of the cache dir holding per-attachment result records.
pub const CACHE_RESULTS_DIR: &str = "results";

// =============================================================================
// Configuration Files
// =============================================================================

/// File extensions recognized as network configurations.
///
/// `conf` and `json` hold a single plugin configuration; `conflist` holds a
/// plugin chain.
pub const CONF_EXTENSIONS: &[&str] = &["conf", "conflist", "json"];

/// Maximum size of a single network configuration file (1 MiB).
pub const MAX_CONF_SIZE: u64 = 1024 * 1024;

/// Maximum size of a cached attachment record (1 MiB).
pub const MAX_CACHE_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Timeouts and Intervals
// =============================================================================

/// Timeout for a single plugin invocation.
pub const PLUGIN_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval of the unconditional registry resync.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Window within which filesystem events are coalesced into one resync.
pub const MONITOR_DEBOUNCE: Duration = Duration::from_millis(250);

// =============================================================================
// Plugin Invocation Environment
// =============================================================================

/// Environment variable carrying the CNI verb.
pub const ENV_COMMAND: &str = "CNI_COMMAND";

/// Environment variable carrying the container (sandbox) ID.
pub const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";

/// Environment variable carrying the network namespace path.
pub const ENV_NETNS: &str = "CNI_NETNS";

/// Environment variable carrying the interface name.
pub const ENV_IFNAME: &str = "CNI_IFNAME";

/// Environment variable carrying `key=value` argument pairs.
pub const ENV_ARGS: &str = "CNI_ARGS";

/// Environment variable carrying the plugin search path.
pub const ENV_PATH: &str = "CNI_PATH";

// =============================================================================
// CNI Argument Keys
// =============================================================================

/// Tells plugins to ignore argument keys they do not understand.
pub const ARG_IGNORE_UNKNOWN: &str = "IgnoreUnknown";

/// Pod namespace argument key.
pub const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";

/// Pod name argument key.
pub const ARG_POD_NAME: &str = "K8S_POD_NAME";

/// Sandbox container ID argument key.
pub const ARG_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";

/// Pod UID argument key.
pub const ARG_POD_UID: &str = "K8S_POD_UID";

/// Requested IP address argument key.
pub const ARG_IP: &str = "IP";

/// Requested MAC address argument key.
pub const ARG_MAC: &str = "MAC";

// =============================================================================
// Capability Names
// =============================================================================

/// Port mapping capability.
pub const CAP_PORT_MAPPINGS: &str = "portMappings";

/// Bandwidth shaping capability.
pub const CAP_BANDWIDTH: &str = "bandwidth";

/// IP range capability.
pub const CAP_IP_RANGES: &str = "ipRanges";

/// Cgroup path capability.
pub const CAP_CGROUP_PATH: &str = "cgroupPath";

/// DNS capability.
pub const CAP_DNS: &str = "dns";

/// Interface alias capability.
pub const CAP_ALIASES: &str = "aliases";

// =============================================================================
// Protocol Keys
// =============================================================================

/// Config key carrying the list of still-valid attachments for the GC verb.
pub const VALID_ATTACHMENTS_KEY: &str = "cni.dev/valid-attachments";

/// Kind discriminator of an on-disk attachment record.
pub const CACHE_KIND: &str = "cniCacheV1";

/// Prefix used when assigning positional interface names (`eth0`, `eth1`, …).
pub const IFNAME_PREFIX: &str = "eth";
