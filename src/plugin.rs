//! The attachment engine and its public facade.
//!
//! [`CniPlugin`] is what a container runtime holds: it keeps the network
//! registry in sync with the configuration directory, serializes lifecycle
//! operations per pod, and drives plugin chains through attach, detach,
//! check, status, and GC.
//!
//! ## Operation Shape
//!
//! Every pod-facing method takes the pod's lock, copies the current registry
//! snapshot, and works against that snapshot for its whole duration; a
//! concurrent config reload never tears an operation in half. No lock is
//! held across a plugin invocation except the pod's own.
//!
//! ## Attachment Resolution
//!
//! A pod that lists attachments gets exactly those, in order. A pod that
//! lists none gets the default network on `eth0`. Interfaces left unnamed
//! are assigned positionally (`eth0`, `eth1`, …), and the same rule is used
//! for GC so plugins see the identities they saw at ADD time.

use crate::cache::{self, CacheRecord};
use crate::config::{self, Network, NetworkConfigList};
use crate::constants::{
    DEFAULT_BIN_DIR, DEFAULT_CACHE_DIR, DEFAULT_CONF_DIR, IFNAME_PREFIX,
};
use crate::error::{Error, Result};
use crate::exec::{ChainDriver, CniExec, GcAttachment, RawExec, supports_check, supports_gc, supports_status};
use crate::monitor::{self, MonitorHandle, ResyncFn};
use crate::netns;
use crate::podlock::PodLockTable;
use crate::registry::{NetworkRegistry, RegistrySnapshot};
use crate::runtimeconf::{RuntimeConf, build_runtime_conf};
use crate::types::{NetResult, PodNetwork};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Construction parameters for [`CniPlugin`].
#[derive(Debug, Clone)]
pub struct CniConfig {
    /// Directory holding network configuration files.
    pub conf_dir: PathBuf,
    /// Directories searched for plugin binaries, in order.
    pub bin_dirs: Vec<PathBuf>,
    /// Directory holding on-disk attachment records.
    pub cache_dir: PathBuf,
    /// Default network name; `None` derives it from filename sort order.
    pub default_network: Option<String>,
    /// Whether to run the background directory monitor.
    pub watch: bool,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from(DEFAULT_CONF_DIR),
            bin_dirs: vec![PathBuf::from(DEFAULT_BIN_DIR)],
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            default_network: None,
            watch: true,
        }
    }
}

// =============================================================================
// Facade
// =============================================================================

/// The runtime-facing network orchestrator.
pub struct CniPlugin {
    inner: Arc<PluginInner>,
    monitor: StdMutex<Option<MonitorHandle>>,
}

struct PluginInner {
    exec: Arc<dyn CniExec>,
    conf_dir: PathBuf,
    bin_dirs: Vec<PathBuf>,
    cache_dir: PathBuf,
    /// Caller-configured default; `None` means "first by filename sort".
    default_network: Option<String>,
    registry: NetworkRegistry,
    pods: PodLockTable,
    ready: AtomicBool,
}

/// One attachment with its interface name resolved.
#[derive(Debug, Clone)]
struct ResolvedAttachment {
    name: String,
    ifname: String,
}

impl CniPlugin {
    /// Initializes the orchestrator with the production executor.
    pub async fn init(config: CniConfig) -> Result<Self> {
        Self::init_with_exec(config, Arc::new(RawExec)).await
    }

    /// Initializes the orchestrator with a caller-supplied executor.
    ///
    /// An empty or missing configuration directory is not an error here; the
    /// registry starts empty and `status()` reports not-ready until configs
    /// appear (the monitor picks them up when `watch` is set).
    pub async fn init_with_exec(config: CniConfig, exec: Arc<dyn CniExec>) -> Result<Self> {
        let inner = Arc::new(PluginInner {
            exec,
            conf_dir: config.conf_dir,
            bin_dirs: config.bin_dirs,
            cache_dir: config.cache_dir,
            default_network: config.default_network.filter(|name| !name.is_empty()),
            registry: NetworkRegistry::new(),
            pods: PodLockTable::new(),
            ready: AtomicBool::new(false),
        });

        inner.sync_networks().await;

        let monitor = if config.watch {
            let weak = Arc::downgrade(&inner);
            let resync: ResyncFn = Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.sync_networks().await;
                    }
                })
            });

            let mut dirs = vec![inner.conf_dir.clone()];
            dirs.extend(inner.bin_dirs.iter().cloned());
            Some(monitor::spawn_monitor(dirs, resync))
        } else {
            None
        };

        Ok(Self {
            inner,
            monitor: StdMutex::new(monitor),
        })
    }

    /// Attaches the pod to its networks; returns one result per attachment,
    /// in attachment order.
    pub async fn set_up_pod(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let _lock = self.inner.pods.acquire(&pod.id).await;
        self.inner.set_up(pod).await
    }

    /// Detaches the pod from its networks. Idempotent: attachments already
    /// gone are not errors.
    pub async fn tear_down_pod(&self, pod: &PodNetwork) -> Result<()> {
        let _lock = self.inner.pods.acquire(&pod.id).await;
        self.inner.tear_down(pod).await
    }

    /// Verifies the pod's attachments via the CHECK verb.
    pub async fn check_pod(&self, pod: &PodNetwork) -> Result<()> {
        let _lock = self.inner.pods.acquire(&pod.id).await;
        self.inner.check(pod).await
    }

    /// Returns the recorded result of each of the pod's attachments.
    pub async fn pod_network_status(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let _lock = self.inner.pods.acquire(&pod.id).await;
        self.inner.network_status(pod).await
    }

    /// Invokes the GC verb on every GC-capable network, passing it the
    /// attachments of `live` pods that belong to it. Attachments naming
    /// unknown networks are silently dropped.
    pub async fn gc(&self, live: &[PodNetwork]) -> Result<()> {
        // Lock every referenced pod, in sorted order, so GC serializes with
        // that pod's lifecycle operations.
        let mut ids: Vec<&str> = live.iter().map(|pod| pod.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.inner.pods.acquire(id).await);
        }

        self.inner.gc(live).await
    }

    /// Reports readiness: a loaded registry, a present default network,
    /// resolvable plugin binaries, and (where supported) a passing STATUS
    /// probe of the default chain.
    pub async fn status(&self) -> Result<()> {
        let result = self.inner.compute_status().await;
        self.inner.ready.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// Last computed readiness; advisory, refreshed by `status()` and by
    /// every registry resync.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Returns the current default network, if any.
    pub fn default_network(&self) -> Option<Arc<Network>> {
        self.inner.registry.snapshot().default_network()
    }

    /// Stops the directory monitor and waits for it to exit. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = {
            let mut monitor = match self.monitor.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            monitor.take()
        };
        if let Some(handle) = handle {
            handle.stop().await;
            info!("network monitor stopped");
        }
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

impl PluginInner {
    /// Reloads the registry from the configuration directory and refreshes
    /// the advisory readiness flag.
    async fn sync_networks(&self) {
        match config::load_networks(&self.conf_dir).await {
            Ok((networks, first_by_sort)) => {
                let default_name = match &self.default_network {
                    Some(name) => name.clone(),
                    None => first_by_sort,
                };

                let snapshot = RegistrySnapshot {
                    networks,
                    default_name,
                };
                let structurally_ready = snapshot.default_network().is_some_and(|net| {
                    net.config.plugins.iter().all(|plugin| {
                        self.exec
                            .find_in_path(&plugin.plugin_type, &self.bin_dirs)
                            .is_ok()
                    })
                });

                debug!(
                    "synced {} networks from {}, default \"{}\"",
                    snapshot.networks.len(),
                    self.conf_dir.display(),
                    snapshot.default_name
                );
                self.registry.replace(snapshot);
                self.ready.store(structurally_ready, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(
                    "failed to sync network configs from {}: {}",
                    self.conf_dir.display(),
                    e
                );
            }
        }
    }

    fn driver(&self) -> ChainDriver<'_> {
        ChainDriver::new(self.exec.as_ref(), &self.bin_dirs, &self.cache_dir)
    }

    async fn set_up(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let snapshot = self.registry.snapshot();
        let attachments = self.resolve_attachments(pod, &snapshot)?;

        // Resolve every network and build every runtime conf before touching
        // anything, so an unknown network or a malformed request invokes no
        // plugin at all.
        let mut plan: Vec<(Arc<Network>, RuntimeConf)> = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let net = snapshot
                .lookup(&attachment.name)
                .ok_or_else(|| Error::UnknownNetwork(attachment.name.clone()))?;
            let rt = build_runtime_conf(
                pod,
                &attachment.ifname,
                pod.runtime_config.get(&attachment.name),
            )?;
            plan.push((net, rt));
        }

        netns::bring_up_loopback(&pod.netns).await?;

        let driver = self.driver();
        let mut results: Vec<NetResult> = Vec::with_capacity(plan.len());
        for (index, (net, rt)) in plan.iter().enumerate() {
            match driver.add(net, rt).await {
                Ok(value) => {
                    results.push(NetResult {
                        name: net.name.clone(),
                        ifname: rt.ifname.clone(),
                        result: value,
                    });
                }
                Err(e) => {
                    warn!(
                        "ADD of network \"{}\" failed for pod {}, unwinding {} attachments: {}",
                        net.name, pod.id, index, e
                    );
                    for unwound in (0..index).rev() {
                        let (done_net, done_rt) = &plan[unwound];
                        if let Err(del_err) = driver
                            .del(done_net, done_rt, Some(&results[unwound].result))
                            .await
                        {
                            warn!(
                                "rollback DEL of network \"{}\" failed for pod {}: {}",
                                done_net.name, pod.id, del_err
                            );
                        }
                    }
                    return Err(Error::PartialSetUp {
                        network: net.name.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            "attached pod {} ({}/{}) to {} networks",
            pod.id,
            pod.namespace,
            pod.name,
            results.len()
        );
        Ok(results)
    }

    async fn tear_down(&self, pod: &PodNetwork) -> Result<()> {
        let snapshot = self.registry.snapshot();
        let targets = self.teardown_targets(pod, &snapshot).await?;
        if targets.is_empty() {
            debug!("nothing to tear down for pod {}", pod.id);
            return Ok(());
        }

        let driver = self.driver();
        let mut first_err: Option<Error> = None;
        for target in targets {
            let outcome = async {
                let rt = build_runtime_conf(
                    pod,
                    &target.ifname,
                    pod.runtime_config.get(&target.net.name),
                )?;
                driver.del(&target.net, &rt, target.prev.as_ref()).await
            }
            .await;

            if let Err(e) = outcome {
                if e.is_benign_teardown() {
                    debug!(
                        "ignoring benign teardown error for \"{}\" of pod {}: {}",
                        target.net.name, pod.id, e
                    );
                } else {
                    warn!(
                        "DEL of network \"{}\" failed for pod {}: {}",
                        target.net.name, pod.id, e
                    );
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves what tear-down should detach: the pod's explicit list, or
    /// the cache records for its container when it gave none. For every
    /// attachment the configuration comes from the registry when the network
    /// is still on disk, and from the cache record when it is not.
    async fn teardown_targets(
        &self,
        pod: &PodNetwork,
        snapshot: &RegistrySnapshot,
    ) -> Result<Vec<TearTarget>> {
        let mut targets = Vec::new();

        if !pod.networks.is_empty() {
            let attachments = assign_ifnames(pod)?;
            for attachment in attachments {
                let record =
                    match cache::read_record(&self.cache_dir, &attachment.name, &pod.id, &attachment.ifname)
                        .await
                    {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("unusable cache record for \"{}\": {}", attachment.name, e);
                            None
                        }
                    };

                let net = match snapshot.lookup(&attachment.name) {
                    Some(net) => Some(net),
                    None => record.as_ref().and_then(|r| network_from_record(r).ok()),
                };
                let Some(net) = net else {
                    // No config anywhere: nothing a plugin could act on.
                    debug!(
                        "no configuration for network \"{}\" of pod {}, skipping",
                        attachment.name, pod.id
                    );
                    continue;
                };

                targets.push(TearTarget {
                    net,
                    ifname: attachment.ifname,
                    prev: record.and_then(|r| (!r.result.is_null()).then_some(r.result)),
                });
            }
        } else {
            for record in cache::list_container_records(&self.cache_dir, &pod.id).await? {
                let net = match snapshot.lookup(&record.network_name) {
                    Some(net) => net,
                    None => match network_from_record(&record) {
                        Ok(net) => net,
                        Err(e) => {
                            warn!(
                                "cannot rebuild config for cached network \"{}\": {}",
                                record.network_name, e
                            );
                            continue;
                        }
                    },
                };

                targets.push(TearTarget {
                    net,
                    ifname: record.if_name.clone(),
                    prev: (!record.result.is_null()).then_some(record.result),
                });
            }
        }

        Ok(targets)
    }

    async fn check(&self, pod: &PodNetwork) -> Result<()> {
        let snapshot = self.registry.snapshot();
        let attachments = self.resolve_attachments(pod, &snapshot)?;
        let driver = self.driver();

        for attachment in attachments {
            let net = snapshot
                .lookup(&attachment.name)
                .ok_or_else(|| Error::UnknownNetwork(attachment.name.clone()))?;
            if !supports_check(&net.config.cni_version) {
                debug!(
                    "network \"{}\" (version {}) predates CHECK, skipping",
                    net.name, net.config.cni_version
                );
                continue;
            }

            let record = cache::read_record(&self.cache_dir, &attachment.name, &pod.id, &attachment.ifname)
                .await?
                .ok_or_else(|| Error::CacheMiss {
                    network: attachment.name.clone(),
                    ifname: attachment.ifname.clone(),
                    container_id: pod.id.clone(),
                })?;

            let rt = build_runtime_conf(
                pod,
                &attachment.ifname,
                pod.runtime_config.get(&attachment.name),
            )?;
            driver.check(&net, &rt, &record.result).await?;
        }
        Ok(())
    }

    async fn network_status(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let snapshot = self.registry.snapshot();
        let attachments = self.resolve_attachments(pod, &snapshot)?;

        let mut results = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let record = cache::read_record(&self.cache_dir, &attachment.name, &pod.id, &attachment.ifname)
                .await?
                .ok_or_else(|| Error::CacheMiss {
                    network: attachment.name.clone(),
                    ifname: attachment.ifname.clone(),
                    container_id: pod.id.clone(),
                })?;
            results.push(NetResult {
                name: attachment.name,
                ifname: attachment.ifname,
                result: record.result,
            });
        }
        Ok(results)
    }

    async fn gc(&self, live: &[PodNetwork]) -> Result<()> {
        let snapshot = self.registry.snapshot();

        // Group still-valid attachments by network, using the same
        // interface-name defaulting as setUp. Unknown networks are dropped.
        let mut by_network: HashMap<String, Vec<GcAttachment>> = HashMap::new();
        for pod in live {
            let attachments = match self.resolve_attachments(pod, &snapshot) {
                Ok(attachments) => attachments,
                Err(e) => {
                    warn!("skipping pod {} in GC payload: {}", pod.id, e);
                    continue;
                }
            };
            for attachment in attachments {
                if snapshot.lookup(&attachment.name).is_none() {
                    continue;
                }
                by_network
                    .entry(attachment.name)
                    .or_default()
                    .push(GcAttachment {
                        container_id: pod.id.clone(),
                        ifname: attachment.ifname,
                    });
            }
        }

        let driver = self.driver();
        let mut first_err: Option<Error> = None;

        let mut names: Vec<&String> = snapshot.networks.keys().collect();
        names.sort_unstable();
        for name in names {
            let Some(net) = snapshot.lookup(name) else {
                continue;
            };
            if !supports_gc(&net.config.cni_version) {
                debug!(
                    "network \"{}\" (version {}) predates GC, skipping",
                    net.name, net.config.cni_version
                );
                continue;
            }

            let valid = by_network.get(name).cloned().unwrap_or_default();
            if let Err(e) = driver.gc(&net, &valid).await {
                warn!("GC of network \"{}\" failed: {}", net.name, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn compute_status(&self) -> Result<()> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(Error::NotReady {
                dir: self.conf_dir.display().to_string(),
            });
        }

        let net = match snapshot.default_network() {
            Some(net) => net,
            None if snapshot.default_name.is_empty() => {
                return Err(Error::NotReady {
                    dir: self.conf_dir.display().to_string(),
                });
            }
            None => {
                return Err(Error::DefaultMissing {
                    name: snapshot.default_name.clone(),
                });
            }
        };

        // Every plugin of the default chain must be resolvable right now.
        for plugin in &net.config.plugins {
            self.exec
                .find_in_path(&plugin.plugin_type, &self.bin_dirs)?;
        }

        if supports_status(&net.config.cni_version) {
            self.driver().status(&net).await?;
        }
        Ok(())
    }

    /// Resolves the pod's target attachments: its explicit list, or the
    /// default network on `eth0` when it gave none.
    fn resolve_attachments(
        &self,
        pod: &PodNetwork,
        snapshot: &RegistrySnapshot,
    ) -> Result<Vec<ResolvedAttachment>> {
        if !pod.networks.is_empty() {
            return assign_ifnames(pod);
        }

        if snapshot.is_empty() || snapshot.default_name.is_empty() {
            return Err(Error::NotReady {
                dir: self.conf_dir.display().to_string(),
            });
        }
        if snapshot.default_network().is_none() {
            return Err(Error::DefaultMissing {
                name: snapshot.default_name.clone(),
            });
        }

        Ok(vec![ResolvedAttachment {
            name: snapshot.default_name.clone(),
            ifname: format!("{IFNAME_PREFIX}0"),
        }])
    }
}

struct TearTarget {
    net: Arc<Network>,
    ifname: String,
    prev: Option<Value>,
}

/// Assigns positional interface names to the pod's explicit attachment list
/// and enforces their uniqueness.
fn assign_ifnames(pod: &PodNetwork) -> Result<Vec<ResolvedAttachment>> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(pod.networks.len());

    for (index, attachment) in pod.networks.iter().enumerate() {
        let ifname = attachment
            .ifname
            .clone()
            .unwrap_or_else(|| format!("{IFNAME_PREFIX}{index}"));
        if !seen.insert(ifname.clone()) {
            return Err(Error::DuplicateInterface {
                pod: pod.id.clone(),
                ifname,
            });
        }
        resolved.push(ResolvedAttachment {
            name: attachment.name.clone(),
            ifname,
        });
    }
    Ok(resolved)
}

fn network_from_record(record: &CacheRecord) -> Result<Arc<Network>> {
    let bytes = record.config_bytes()?;
    let config = NetworkConfigList::from_bytes(&bytes).map_err(|reason| Error::CacheRead {
        path: Path::new(&record.network_name).to_path_buf(),
        reason,
    })?;
    Ok(Arc::new(Network {
        name: record.network_name.clone(),
        filename: String::new(),
        config,
    }))
}
