//! The embedded plugin-execution layer.
//!
//! This module owns the CNI wire contract: it resolves plugin binaries,
//! assembles each plugin's stdin document and `CNI_*` environment, drives
//! whole chains through their verbs, and decodes plugin output. It also owns
//! the on-disk attachment records (one written per successful ADD, removed
//! after DEL), which the rest of the crate only reads.
//!
//! ## The Exec Seam
//!
//! All subprocess interaction goes through the [`CniExec`] trait so tests can
//! substitute a scripted executor. [`RawExec`] is the production
//! implementation on `tokio::process`.
//!
//! ## Verb Semantics
//!
//! | Verb   | Chain order | stdin extras                                |
//! |--------|-------------|---------------------------------------------|
//! | ADD    | forward     | `runtimeConfig`, `prevResult`               |
//! | DEL    | reverse     | `runtimeConfig`, `prevResult` (if cached)   |
//! | CHECK  | forward     | `runtimeConfig`, `prevResult` (required)    |
//! | GC     | forward     | `cni.dev/valid-attachments`                 |
//! | STATUS | forward     | none                                        |
//!
//! GC and STATUS are only meaningful from CNI 1.1.0; CHECK from 0.4.0.
//! Callers gate on [`supports_gc`], [`supports_status`], [`supports_check`].

use crate::cache::{self, CacheRecord};
use crate::config::{Network, PluginConfig};
use crate::constants::{
    CACHE_KIND, ENV_ARGS, ENV_COMMAND, ENV_CONTAINER_ID, ENV_IFNAME, ENV_NETNS, ENV_PATH,
    PLUGIN_EXEC_TIMEOUT, VALID_ATTACHMENTS_KEY,
};
use crate::error::{Error, Result};
use crate::runtimeconf::RuntimeConf;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

// =============================================================================
// Exec Seam
// =============================================================================

/// Low-level plugin invocation: subprocess exec and binary resolution.
///
/// Implementations must be safe to share across pods; one invocation must not
/// observe another's state.
#[async_trait]
pub trait CniExec: Send + Sync {
    /// Runs the plugin binary at `plugin_path` with `stdin` piped in and the
    /// given environment, returning its stdout on success.
    async fn exec_plugin(
        &self,
        plugin_path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
    ) -> Result<Vec<u8>>;

    /// Resolves a plugin type to a binary within the search path.
    fn find_in_path(&self, plugin: &str, paths: &[PathBuf]) -> Result<PathBuf>;
}

/// Production executor on `tokio::process`.
pub struct RawExec;

/// The structured error object a plugin may print on stdout when it fails.
#[derive(Debug, Deserialize)]
struct PluginErrorBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

#[async_trait]
impl CniExec for RawExec {
    async fn exec_plugin(
        &self,
        plugin_path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
    ) -> Result<Vec<u8>> {
        let plugin = plugin_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| plugin_path.display().to_string());
        let verb = env
            .iter()
            .find(|(k, _)| k == ENV_COMMAND)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        let mut command = tokio::process::Command::new(plugin_path);
        command
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| Error::ExecFailed {
            plugin: plugin.clone(),
            reason: e.to_string(),
        })?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await.map_err(|e| Error::ExecFailed {
                plugin: plugin.clone(),
                reason: format!("failed to write stdin: {e}"),
            })?;
            // Dropping the pipe closes the plugin's stdin.
        }

        let output = tokio::time::timeout(PLUGIN_EXEC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{verb} via plugin \"{plugin}\""),
                duration: PLUGIN_EXEC_TIMEOUT,
            })?
            .map_err(|e| Error::ExecFailed {
                plugin: plugin.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            // Non-zero exit with a JSON error object on stdout is the
            // plugin's error channel.
            if let Ok(body) = serde_json::from_slice::<PluginErrorBody>(&output.stdout) {
                let msg = if body.details.is_empty() {
                    body.msg
                } else {
                    format!("{}: {}", body.msg, body.details)
                };
                return Err(Error::PluginReported {
                    plugin,
                    code: body.code,
                    msg,
                });
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = if stderr.trim().is_empty() {
                output.status.to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::ExecFailed { plugin, reason });
        }

        Ok(output.stdout)
    }

    fn find_in_path(&self, plugin: &str, paths: &[PathBuf]) -> Result<PathBuf> {
        for dir in paths {
            let candidate = dir.join(plugin);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::PluginNotFound {
            plugin: plugin.to_string(),
            paths: paths.to_vec(),
        })
    }
}

// =============================================================================
// Version Gating
// =============================================================================

/// True when `version` is at least `major.minor`. Unparsable components
/// compare as zero.
fn version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.trim().split('.');
    let have_major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let have_minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (have_major, have_minor) >= (major, minor)
}

/// GC is part of the contract from CNI 1.1.0.
pub fn supports_gc(version: &str) -> bool {
    version_at_least(version, 1, 1)
}

/// STATUS is part of the contract from CNI 1.1.0.
pub fn supports_status(version: &str) -> bool {
    version_at_least(version, 1, 1)
}

/// CHECK is part of the contract from CNI 0.4.0.
pub fn supports_check(version: &str) -> bool {
    version_at_least(version, 0, 4)
}

// =============================================================================
// Chain Driver
// =============================================================================

/// One still-valid attachment, as handed to the GC verb.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GcAttachment {
    /// Sandbox container ID.
    #[serde(rename = "containerID")]
    pub container_id: String,
    /// Interface name the attachment used.
    pub ifname: String,
}

/// Drives whole plugin chains through CNI verbs.
pub struct ChainDriver<'a> {
    exec: &'a dyn CniExec,
    bin_dirs: &'a [PathBuf],
    cache_dir: &'a Path,
}

impl<'a> ChainDriver<'a> {
    /// Creates a driver over the given executor and directories.
    pub fn new(exec: &'a dyn CniExec, bin_dirs: &'a [PathBuf], cache_dir: &'a Path) -> Self {
        Self {
            exec,
            bin_dirs,
            cache_dir,
        }
    }

    /// Runs ADD over the chain, threading `prevResult` forward, and records
    /// the attachment on disk. Returns the final chain result.
    pub async fn add(&self, net: &Network, rt: &RuntimeConf) -> Result<Value> {
        let mut prev: Option<Value> = None;
        for plugin in &net.config.plugins {
            let stdin = build_plugin_config(net, plugin, Some(rt), prev.as_ref(), None)?;
            let stdout = self.invoke(plugin, "ADD", &stdin, Some(rt)).await?;
            prev = Some(parse_result(&plugin.plugin_type, &stdout)?);
        }
        let result = prev.unwrap_or(Value::Null);

        let record = CacheRecord {
            kind: CACHE_KIND.to_string(),
            container_id: rt.container_id.clone(),
            config: CacheRecord::encode_config(&net.config.bytes),
            if_name: rt.ifname.clone(),
            network_name: net.name.clone(),
            cni_args: rt.args.clone(),
            capability_args: rt.capability_args.clone(),
            result: result.clone(),
        };
        cache::write_record(self.cache_dir, &record).await?;

        debug!(
            "added network \"{}\" to {} as {}",
            net.name, rt.container_id, rt.ifname
        );
        Ok(result)
    }

    /// Runs DEL over the chain in reverse and drops the on-disk record.
    pub async fn del(&self, net: &Network, rt: &RuntimeConf, prev: Option<&Value>) -> Result<()> {
        for plugin in net.config.plugins.iter().rev() {
            let stdin = build_plugin_config(net, plugin, Some(rt), prev, None)?;
            self.invoke(plugin, "DEL", &stdin, Some(rt)).await?;
        }

        if let Err(e) =
            cache::remove_record(self.cache_dir, &net.name, &rt.container_id, &rt.ifname).await
        {
            warn!(
                "failed to drop cache record for {}-{}-{}: {}",
                net.name, rt.container_id, rt.ifname, e
            );
        }

        debug!(
            "removed network \"{}\" from {} ({})",
            net.name, rt.container_id, rt.ifname
        );
        Ok(())
    }

    /// Runs CHECK over the chain with the cached result as `prevResult`.
    pub async fn check(&self, net: &Network, rt: &RuntimeConf, prev: &Value) -> Result<()> {
        for plugin in &net.config.plugins {
            let stdin = build_plugin_config(net, plugin, Some(rt), Some(prev), None)?;
            self.invoke(plugin, "CHECK", &stdin, Some(rt)).await?;
        }
        Ok(())
    }

    /// Runs GC over the chain, passing the still-valid attachment list.
    pub async fn gc(&self, net: &Network, valid: &[GcAttachment]) -> Result<()> {
        for plugin in &net.config.plugins {
            let stdin = build_plugin_config(net, plugin, None, None, Some(valid))?;
            self.invoke(plugin, "GC", &stdin, None).await?;
        }
        Ok(())
    }

    /// Runs STATUS over the chain; any per-plugin failure surfaces.
    pub async fn status(&self, net: &Network) -> Result<()> {
        for plugin in &net.config.plugins {
            let stdin = build_plugin_config(net, plugin, None, None, None)?;
            self.invoke(plugin, "STATUS", &stdin, None).await?;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        plugin: &PluginConfig,
        verb: &str,
        stdin: &[u8],
        rt: Option<&RuntimeConf>,
    ) -> Result<Vec<u8>> {
        let path = self.exec.find_in_path(&plugin.plugin_type, self.bin_dirs)?;

        let mut env = vec![
            (ENV_COMMAND.to_string(), verb.to_string()),
            (ENV_PATH.to_string(), self.search_path()),
        ];
        if let Some(rt) = rt {
            env.push((ENV_CONTAINER_ID.to_string(), rt.container_id.clone()));
            env.push((ENV_NETNS.to_string(), rt.netns.clone()));
            env.push((ENV_IFNAME.to_string(), rt.ifname.clone()));
            env.push((ENV_ARGS.to_string(), format_cni_args(&rt.args)));
        }

        self.exec.exec_plugin(&path, stdin, &env).await
    }

    fn search_path(&self) -> String {
        self.bin_dirs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

// =============================================================================
// Document Assembly
// =============================================================================

/// Builds one plugin's stdin document: the plugin's raw config with the chain
/// name and version, the capability-filtered `runtimeConfig`, the previous
/// result, and (for GC) the valid-attachment list injected.
fn build_plugin_config(
    net: &Network,
    plugin: &PluginConfig,
    rt: Option<&RuntimeConf>,
    prev: Option<&Value>,
    valid: Option<&[GcAttachment]>,
) -> Result<Vec<u8>> {
    // Parse guarantees every plugin entry is an object.
    let mut obj = match &plugin.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    obj.insert("name".to_string(), Value::String(net.name.clone()));
    obj.insert(
        "cniVersion".to_string(),
        Value::String(net.config.cni_version.clone()),
    );

    // Only capabilities the plugin declares get its runtimeConfig entries.
    if let Some(rt) = rt {
        let mut runtime_config = Map::new();
        for (capability, enabled) in &plugin.capabilities {
            if *enabled
                && let Some(value) = rt.capability_args.get(capability)
            {
                runtime_config.insert(capability.clone(), value.clone());
            }
        }
        if !runtime_config.is_empty() {
            obj.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
        }
    }

    if let Some(prev) = prev
        && !prev.is_null()
    {
        obj.insert("prevResult".to_string(), prev.clone());
    }

    if let Some(valid) = valid {
        obj.insert(
            VALID_ATTACHMENTS_KEY.to_string(),
            serde_json::to_value(valid)?,
        );
    }

    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

/// Joins argument pairs into the `CNI_ARGS` wire form.
fn format_cni_args(args: &[(String, String)]) -> String {
    args.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_result(plugin: &str, stdout: &[u8]) -> Result<Value> {
    let trimmed = stdout
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &stdout[start..])
        .unwrap_or(&[]);
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(trimmed).map_err(|e| Error::DecodeFailed {
        plugin: plugin.to_string(),
        reason: e.to_string(),
    })
}
