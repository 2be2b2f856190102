//! Network configuration model and directory loader.
//!
//! A network is a named, version-tagged chain of plugin configurations read
//! from a single file. Files holding a single plugin config are wrapped into
//! a one-element chain so the rest of the crate only ever deals with chains.
//!
//! ## Discovery Rules
//!
//! - Only files with a recognized extension are considered (`conf`, `json`
//!   for single configs, `conflist` for chains).
//! - Filenames are sorted byte-lexicographically; the first successfully
//!   parsed network becomes the candidate default.
//! - Duplicate network names: the first occurrence wins, later ones are
//!   ignored without error.
//! - Unparseable files are skipped with a warning; only directory-level I/O
//!   failures are fatal.

use crate::constants::{CONF_EXTENSIONS, MAX_CONF_SIZE};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Configuration Model
// =============================================================================

/// One plugin entry of a chain.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Plugin type; also the binary name resolved in the plugin path.
    pub plugin_type: String,
    /// Capabilities the plugin declares; gates runtimeConfig injection.
    pub capabilities: HashMap<String, bool>,
    /// The plugin's raw configuration object.
    pub raw: Value,
}

/// A parsed plugin chain.
#[derive(Debug, Clone)]
pub struct NetworkConfigList {
    /// Network name, unique within the registry.
    pub name: String,
    /// CNI spec version declared by the chain.
    pub cni_version: String,
    /// Plugins in invocation order.
    pub plugins: Vec<PluginConfig>,
    /// Canonical bytes of the chain document.
    pub bytes: Vec<u8>,
}

/// A named network: the chain plus its source filename.
///
/// Immutable once constructed; replaced wholesale when its source file
/// changes. The filename is used only for deterministic tiebreaking.
#[derive(Debug, Clone)]
pub struct Network {
    /// Logical network name.
    pub name: String,
    /// Source filename within the config directory.
    pub filename: String,
    /// The parsed chain.
    pub config: NetworkConfigList,
}

impl NetworkConfigList {
    /// Parses a chain document, wrapping a single plugin config if needed.
    ///
    /// Accepts both shapes:
    /// - a chain: `{"name", "cniVersion", "plugins": [...]}`
    /// - a single config: `{"name", "cniVersion", "type", ...}`
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
        let obj = value
            .as_object()
            .ok_or_else(|| "top-level document is not an object".to_string())?;

        let name = string_field(obj, "name")?;
        if name.is_empty() {
            return Err("network name is empty".to_string());
        }
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            return Err(format!("network name \"{name}\" contains a path separator"));
        }

        let cni_version = obj
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (plugins, canonical) = if obj.contains_key("plugins") {
            let list = obj
                .get("plugins")
                .and_then(Value::as_array)
                .ok_or_else(|| "\"plugins\" is not an array".to_string())?;
            if list.is_empty() {
                return Err("plugin chain is empty".to_string());
            }
            let plugins = list
                .iter()
                .map(PluginConfig::from_value)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            (plugins, value.clone())
        } else {
            // Single plugin config: wrap as a one-element chain.
            let plugin = PluginConfig::from_value(&value)?;
            let wrapped = serde_json::json!({
                "name": name,
                "cniVersion": cni_version,
                "plugins": [value],
            });
            (vec![plugin], wrapped)
        };

        let bytes = serde_json::to_vec(&canonical).map_err(|e| e.to_string())?;

        Ok(Self {
            name,
            cni_version,
            plugins,
            bytes,
        })
    }
}

impl PluginConfig {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "plugin entry is not an object".to_string())?;
        let plugin_type = string_field(obj, "type")?;
        if plugin_type.is_empty() {
            return Err("plugin \"type\" is empty".to_string());
        }

        let capabilities = obj
            .get("capabilities")
            .and_then(Value::as_object)
            .map(|caps| {
                caps.iter()
                    .map(|(k, v)| (k.clone(), v.as_bool().unwrap_or(false)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            plugin_type,
            capabilities,
            raw: value.clone(),
        })
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> std::result::Result<String, String> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(format!("\"{key}\" is not a string")),
        None => Err(format!("missing \"{key}\"")),
    }
}

// =============================================================================
// Directory Loader
// =============================================================================

/// Reads every parseable network definition under `dir`.
///
/// Returns the `name → network` map and the candidate default name (the
/// first network by ASCII-betical filename order, empty when the directory
/// holds no parseable files). A missing directory is treated as empty so a
/// not-yet-created config directory does not fail startup.
pub async fn load_networks(dir: &Path) -> Result<(HashMap<String, Arc<Network>>, String)> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((HashMap::new(), String::new()));
        }
        Err(e) => {
            return Err(Error::ConfDir {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::ConfDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })? {
        let path = entry.path();
        if !recognized_extension(&path) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            files.push((name.to_string(), path));
        }
    }

    // ASCII-betical ordering drives both the candidate default and the
    // duplicate-name policy.
    files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut networks = HashMap::new();
    let mut default_name = String::new();

    for (filename, path) in files {
        let config = match read_conf_file(&path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("skipping network config {}: {}", path.display(), e);
                continue;
            }
        };

        if networks.contains_key(&config.name) {
            warn!(
                "ignoring network \"{}\" from {}: name already defined by an earlier file",
                config.name, filename
            );
            continue;
        }

        debug!(
            "loaded network \"{}\" from {} ({} plugins, version {})",
            config.name,
            filename,
            config.plugins.len(),
            config.cni_version
        );

        if default_name.is_empty() {
            default_name = config.name.clone();
        }
        networks.insert(
            config.name.clone(),
            Arc::new(Network {
                name: config.name.clone(),
                filename,
                config,
            }),
        );
    }

    Ok((networks, default_name))
}

fn recognized_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CONF_EXTENSIONS.contains(&ext))
}

async fn read_conf_file(path: &Path) -> std::result::Result<NetworkConfigList, String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.len() > MAX_CONF_SIZE {
        return Err(format!("exceeds {MAX_CONF_SIZE} bytes"));
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    NetworkConfigList::from_bytes(&bytes)
}
