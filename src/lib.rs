//! # magiknet
//!
//! **CNI network orchestration for pod sandboxes.**
//!
//! This crate sits between a container runtime and out-of-process CNI
//! plugins. For each pod sandbox it attaches one or more interfaces into the
//! pod's network namespace by invoking plugin binaries with a precisely
//! shaped configuration and environment, tears them down on pod deletion,
//! and reports their status on demand. It pairs with `magikrun`, which owns
//! the container side of the sandbox.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                            magiknet                                │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐    │
//! │  │                     CniPlugin Facade                       │    │
//! │  │  set_up_pod │ tear_down_pod │ check_pod │ status │ gc      │    │
//! │  └───────┬──────────────┬──────────────────┬───────────┬──────┘    │
//! │          │              │                  │           │           │
//! │  ┌───────┴──────┐ ┌─────┴──────┐ ┌─────────┴───┐ ┌─────┴──────┐    │
//! │  │ Pod lock     │ │ Registry   │ │ Chain       │ │ Cache      │    │
//! │  │ table        │ │ snapshots  │ │ driver      │ │ records    │    │
//! │  │ (per-pod     │ │ (atomic    │ │ (ADD/DEL/   │ │ (detach    │    │
//! │  │  serialize)  │ │  swap)     │ │  CHECK/GC)  │ │  w/o conf) │    │
//! │  └──────────────┘ └─────▲──────┘ └──────┬──────┘ └────────────┘    │
//! │                        │               │                           │
//! │                ┌───────┴──────┐  ┌─────┴──────┐                    │
//! │                │ Dir monitor  │  │ Plugin     │                    │
//! │                │ + periodic   │  │ subprocess │                    │
//! │                │ resync       │  │ exec       │                    │
//! │                └──────────────┘  └────────────┘                    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency Model
//!
//! Operations on the same pod are strictly serialized through a ref-counted
//! per-pod lock; operations on distinct pods run fully in parallel. The
//! registry publishes immutable snapshots that are swapped atomically, so a
//! configuration reload never tears a running operation. No shared lock is
//! ever held across a plugin invocation.
//!
//! # Detach Without Configuration
//!
//! Every successful attach leaves an on-disk record (the CNI `cniCacheV1`
//! format) carrying the chain configuration and result. Tear-down consults
//! those records when the pod gave no explicit attachment list, and falls
//! back to the recorded configuration when the network's file has since been
//! deleted, so detach keeps working after the config is gone.
//!
//! # Example
//!
//! ```rust,ignore
//! use magiknet::{CniConfig, CniPlugin, PodNetwork};
//!
//! #[tokio::main]
//! async fn main() -> magiknet::Result<()> {
//!     let plugin = CniPlugin::init(CniConfig::default()).await?;
//!     plugin.status().await?;
//!
//!     let pod = PodNetwork {
//!         namespace: "default".to_string(),
//!         name: "web".to_string(),
//!         id: "4db1…".to_string(),
//!         uid: "9414bd03…".to_string(),
//!         netns: "/var/run/netns/web".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let results = plugin.set_up_pod(&pod).await?;
//!     println!("attached {} interfaces", results.len());
//!
//!     plugin.tear_down_pod(&pod).await?;
//!     plugin.shutdown().await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod cache;
mod config;
mod constants;
mod error;
mod exec;
mod monitor;
mod netns;
mod plugin;
mod podlock;
mod registry;
mod runtimeconf;
mod types;

// =============================================================================
// Public API
// =============================================================================

pub use cache::{CacheRecord, list_container_records, read_record};
pub use config::{Network, NetworkConfigList, PluginConfig, load_networks};
pub use constants::{
    DEFAULT_BIN_DIR, DEFAULT_CACHE_DIR, DEFAULT_CONF_DIR, RESYNC_INTERVAL,
};
pub use error::{Error, Result};
pub use exec::{ChainDriver, CniExec, GcAttachment, RawExec};
pub use plugin::{CniConfig, CniPlugin};
pub use podlock::{PodLockGuard, PodLockTable};
pub use registry::{NetworkRegistry, RegistrySnapshot};
pub use runtimeconf::{RuntimeConf, build_runtime_conf};
pub use types::{
    BandwidthConfig, CniDns, CniInterface, CniIpConfig, CniResult, CniRoute, IpRange,
    NetAttachment, NetResult, PodNetwork, PortMapping, RuntimeConfig,
};
