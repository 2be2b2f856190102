//! Error types for the CNI orchestration layer.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for CNI orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the CNI orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Readiness Errors
    // =========================================================================
    /// The registry holds no networks at all.
    #[error("cni config uninitialized: no networks found in {dir}")]
    NotReady { dir: String },

    /// A default network was configured but is absent from the registry.
    #[error("default network \"{name}\" is not present in the registry")]
    DefaultMissing { name: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// The configuration directory could not be enumerated. Parse failures
    /// of individual files are logged and skipped, never returned.
    #[error("failed to read config directory {path}: {reason}")]
    ConfDir { path: PathBuf, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// A requested IP did not parse as a v4 or v6 address.
    #[error("unable to parse IP address \"{0}\"")]
    InvalidIp(String),

    /// A requested MAC did not parse as a 6-byte hardware address.
    #[error("failed to parse MAC address \"{0}\"")]
    InvalidMac(String),

    /// Two attachments of one pod resolved to the same interface name.
    #[error("pod {pod} requests interface \"{ifname}\" more than once")]
    DuplicateInterface { pod: String, ifname: String },

    // =========================================================================
    // Network Resolution Errors
    // =========================================================================
    /// An attachment names a network absent from the current snapshot.
    #[error("network \"{0}\" is not present in the registry")]
    UnknownNetwork(String),

    // =========================================================================
    // Plugin Execution Errors
    // =========================================================================
    /// A plugin binary could not be resolved in the search path.
    #[error("failed to find plugin \"{plugin}\" in path {paths:?}")]
    PluginNotFound { plugin: String, paths: Vec<PathBuf> },

    /// A plugin exited non-zero and reported a structured error.
    #[error("plugin \"{plugin}\" failed (code {code}): {msg}")]
    PluginReported { plugin: String, code: u32, msg: String },

    /// A plugin could not be spawned or exited non-zero without a report.
    #[error("plugin \"{plugin}\" failed: {reason}")]
    ExecFailed { plugin: String, reason: String },

    /// A plugin produced stdout that could not be decoded.
    #[error("plugin \"{plugin}\" produced unparsable output: {reason}")]
    DecodeFailed { plugin: String, reason: String },

    /// A plugin invocation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// An attach failed partway; previously added attachments were unwound.
    #[error("failed to set up network \"{network}\": {source} (previously added attachments were removed)")]
    PartialSetUp {
        network: String,
        #[source]
        source: Box<Error>,
    },

    /// Configuring loopback inside the pod namespace failed.
    #[error("failed to configure loopback in {netns}: {reason}")]
    Loopback { netns: String, reason: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// No on-disk record exists for an attachment.
    #[error("no cached result for network \"{network}\" interface \"{ifname}\" of container {container_id}")]
    CacheMiss {
        network: String,
        ifname: String,
        container_id: String,
    },

    /// An on-disk record exists but could not be used.
    #[error("failed to read cache record {path}: {reason}")]
    CacheRead { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors that tear-down treats as "already gone".
    pub fn is_benign_teardown(&self) -> bool {
        matches!(
            self,
            Error::CacheMiss { .. } | Error::UnknownNetwork(_)
        )
    }
}
