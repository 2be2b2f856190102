//! On-disk attachment records.
//!
//! Every successful attach leaves one record under
//! `<cacheDir>/results/<network>-<containerID>-<ifname>` holding the chain
//! configuration (base64), the invocation arguments, and the final result.
//! The record is what makes detach possible after the original configuration
//! has vanished from the config directory, and what `networkStatus` reads
//! back without re-invoking plugins.
//!
//! Records are written by the plugin-execution layer on ADD and removed on
//! DEL; everything else only reads.

use crate::constants::{CACHE_KIND, CACHE_RESULTS_DIR, MAX_CACHE_FILE_SIZE};
use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One attachment record, the `cniCacheV1` on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Format discriminator; always `cniCacheV1`.
    pub kind: String,
    /// Sandbox container ID the attachment belongs to.
    pub container_id: String,
    /// Base64 of the chain configuration document used at ADD time.
    pub config: String,
    /// Interface name inside the pod namespace.
    pub if_name: String,
    /// Network name.
    pub network_name: String,
    /// `key=value` CNI argument pairs used at ADD time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cni_args: Vec<(String, String)>,
    /// Capability arguments used at ADD time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capability_args: HashMap<String, Value>,
    /// Final chain result.
    #[serde(default)]
    pub result: Value,
}

impl CacheRecord {
    /// Decodes the embedded chain configuration bytes.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.config)
            .map_err(|e| Error::CacheRead {
                path: PathBuf::from(&self.network_name),
                reason: format!("invalid base64 config: {e}"),
            })
    }

    /// Encodes chain configuration bytes for embedding.
    pub fn encode_config(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }
}

/// Path of the record for one `(network, containerID, ifname)` triple.
///
/// Each component must be a single path element; network names are validated
/// at load time and interface names are assigned by the engine, so only a
/// hostile container ID could smuggle a separator. Reject rather than
/// sanitize.
pub fn record_path(
    cache_dir: &Path,
    network: &str,
    container_id: &str,
    ifname: &str,
) -> Result<PathBuf> {
    for component in [network, container_id, ifname] {
        if component.is_empty() || component.contains('/') || component.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::CacheRead {
                path: cache_dir.to_path_buf(),
                reason: format!("invalid cache key component \"{component}\""),
            });
        }
    }
    Ok(cache_dir
        .join(CACHE_RESULTS_DIR)
        .join(format!("{network}-{container_id}-{ifname}")))
}

/// Writes one record, atomically (temp file + rename).
pub async fn write_record(cache_dir: &Path, record: &CacheRecord) -> Result<()> {
    let path = record_path(
        cache_dir,
        &record.network_name,
        &record.container_id,
        &record.if_name,
    )?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let data = serde_json::to_vec(record)?;
    // Append rather than with_extension: interface names may carry dots
    // (VLAN subinterfaces), which must survive in the final filename.
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    debug!(
        "cached attachment {}-{}-{}",
        record.network_name, record.container_id, record.if_name
    );
    Ok(())
}

/// Reads the record for one attachment; `Ok(None)` when no record exists.
pub async fn read_record(
    cache_dir: &Path,
    network: &str,
    container_id: &str,
    ifname: &str,
) -> Result<Option<CacheRecord>> {
    let path = record_path(cache_dir, network, container_id, ifname)?;
    match read_record_file(&path).await {
        Ok(record) => Ok(Some(record)),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes the record for one attachment; missing records are fine.
pub async fn remove_record(
    cache_dir: &Path,
    network: &str,
    container_id: &str,
    ifname: &str,
) -> Result<()> {
    let path = record_path(cache_dir, network, container_id, ifname)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recovers every record belonging to `container_id`, in filename-sorted
/// order.
///
/// This is the tear-down path for pods that did not specify attachments: the
/// cache is the source of truth for what was attached. A missing results
/// directory yields an empty list. Records that fail to parse are skipped
/// with a warning so one corrupt file cannot wedge pod deletion.
pub async fn list_container_records(
    cache_dir: &Path,
    container_id: &str,
) -> Result<Vec<CacheRecord>> {
    let results_dir = cache_dir.join(CACHE_RESULTS_DIR);
    let mut entries = match tokio::fs::read_dir(&results_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            // Cheap filename filter first; the parsed record decides.
            // In-flight temp files are never records.
            if name.contains(container_id) && !name.ends_with(".tmp") {
                files.push((name.to_string(), entry.path()));
            }
        }
    }
    files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut records = Vec::new();
    for (_, path) in files {
        match read_record_file(&path).await {
            Ok(record) if record.container_id == container_id => records.push(record),
            Ok(_) => {}
            Err(e) => warn!("skipping cache record {}: {}", path.display(), e),
        }
    }
    Ok(records)
}

async fn read_record_file(path: &Path) -> Result<CacheRecord> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > MAX_CACHE_FILE_SIZE {
        return Err(Error::CacheRead {
            path: path.to_path_buf(),
            reason: format!("exceeds {MAX_CACHE_FILE_SIZE} bytes"),
        });
    }

    let bytes = tokio::fs::read(path).await?;
    let record: CacheRecord = serde_json::from_slice(&bytes).map_err(|e| Error::CacheRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if record.kind != CACHE_KIND {
        return Err(Error::CacheRead {
            path: path.to_path_buf(),
            reason: format!("unknown record kind \"{}\"", record.kind),
        });
    }
    Ok(record)
}
