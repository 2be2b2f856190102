//! Shared test harness: a scripted plugin executor and fixture helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use magiknet::{CniExec, Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Scripted Executor
// =============================================================================

/// One scripted plugin invocation.
#[derive(Default)]
pub struct FakePlugin {
    /// Env pairs that must be present in the invocation.
    pub expected_env: Vec<(String, String)>,
    /// Identity fields the stdin document must carry.
    pub expected_conf: Option<Value>,
    /// Result bytes returned on success.
    pub result: Option<Value>,
    /// Failure injected instead of a result.
    pub error: Option<String>,
}

/// A `CniExec` that replays scripted plugins and counts verbs, in place of
/// real subprocess execution.
///
/// Each verb keeps its own cursor into the same scripted list, mirroring how
/// a chain that was ADDed is later DELed/CHECKed in matching positions.
#[derive(Default)]
pub struct FakeExec {
    plugins: Mutex<Vec<FakePlugin>>,
    add_index: AtomicUsize,
    del_index: AtomicUsize,
    check_index: AtomicUsize,
    gc_index: AtomicUsize,
    pub fail_find: AtomicBool,
    pub fail_status: AtomicBool,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next plugin invocation.
    ///
    /// `expected_conf` is matched on the identity fields only (`name`,
    /// `type`, `cniVersion`, valid-attachments), the way a plugin would
    /// recognize its own config regardless of injected runtime state.
    pub fn add_plugin(
        &self,
        expected_env: Vec<(String, String)>,
        expected_conf: Option<&str>,
        result: Option<Value>,
    ) {
        let expected_conf = expected_conf.map(|conf| {
            let doc: Value = serde_json::from_str(conf).expect("scripted conf is valid JSON");
            essential_fields(&doc)
        });
        self.plugins.lock().unwrap().push(FakePlugin {
            expected_env,
            expected_conf,
            result,
            error: None,
        });
    }

    /// Scripts a failing plugin invocation.
    pub fn add_failing_plugin(&self, message: &str) {
        self.plugins.lock().unwrap().push(FakePlugin {
            error: Some(message.to_string()),
            ..Default::default()
        });
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.lock().unwrap().len()
    }

    pub fn adds(&self) -> usize {
        self.add_index.load(Ordering::SeqCst)
    }

    pub fn dels(&self) -> usize {
        self.del_index.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.check_index.load(Ordering::SeqCst)
    }

    pub fn gcs(&self) -> usize {
        self.gc_index.load(Ordering::SeqCst)
    }

    pub fn set_fail_find(&self, fail: bool) {
        self.fail_find.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CniExec for FakeExec {
    async fn exec_plugin(
        &self,
        _plugin_path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
    ) -> Result<Vec<u8>> {
        let command = env
            .iter()
            .find(|(key, _)| key == "CNI_COMMAND")
            .map(|(_, value)| value.clone())
            .expect("CNI_COMMAND must be set");

        let index = match command.as_str() {
            "ADD" => self.add_index.fetch_add(1, Ordering::SeqCst),
            "DEL" => self.del_index.fetch_add(1, Ordering::SeqCst),
            "CHECK" => self.check_index.fetch_add(1, Ordering::SeqCst),
            "GC" => self.gc_index.fetch_add(1, Ordering::SeqCst),
            "VERSION" => {
                return Ok(
                    br#"{"cniVersion":"1.1.0","supportedVersions":["0.3.0","0.3.1","0.4.0","1.0.0","1.1.0"]}"#
                        .to_vec(),
                );
            }
            "STATUS" => {
                if self.fail_status.load(Ordering::SeqCst) {
                    return Err(Error::ExecFailed {
                        plugin: "fake".to_string(),
                        reason: "status fails".to_string(),
                    });
                }
                return Ok(Vec::new());
            }
            other => panic!("unexpected CNI_COMMAND {other}"),
        };

        let plugins = self.plugins.lock().unwrap();
        assert!(
            index < plugins.len(),
            "no scripted plugin for {command} invocation #{index}"
        );
        let plugin = &plugins[index];

        if let Some(expected) = &plugin.expected_conf {
            let doc: Value = serde_json::from_slice(stdin).expect("stdin is valid JSON");
            assert_eq!(
                &essential_fields(&doc),
                expected,
                "stdin mismatch for {command} invocation #{index}"
            );
        }

        for (key, value) in &plugin.expected_env {
            assert!(
                env.iter().any(|(k, v)| k == key && v == value),
                "missing env {key}={value} in {env:?}"
            );
        }

        if let Some(message) = &plugin.error {
            return Err(Error::ExecFailed {
                plugin: "fake".to_string(),
                reason: message.clone(),
            });
        }

        Ok(plugin
            .result
            .as_ref()
            .map(|value| serde_json::to_vec(value).expect("scripted result serializes"))
            .unwrap_or_default())
    }

    fn find_in_path(&self, plugin: &str, paths: &[PathBuf]) -> Result<PathBuf> {
        assert!(!paths.is_empty(), "plugin search path must not be empty");
        if self.fail_find.load(Ordering::SeqCst) {
            return Err(Error::PluginNotFound {
                plugin: plugin.to_string(),
                paths: paths.to_vec(),
            });
        }
        Ok(paths[0].join(plugin))
    }
}

/// Projects a config document onto its identity fields for comparison.
pub fn essential_fields(doc: &Value) -> Value {
    let mut out = serde_json::Map::new();
    for key in ["cniVersion", "name", "type", "cni.dev/valid-attachments"] {
        if let Some(value) = doc.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

// =============================================================================
// Fixtures
// =============================================================================

/// Writes a single-plugin network config; returns the file's contents.
pub fn write_config(
    dir: &Path,
    filename: &str,
    net_name: &str,
    plugin: &str,
    version: &str,
) -> String {
    let conf = format!(
        "{{\n  \"name\": \"{net_name}\",\n  \"type\": \"{plugin}\",\n  \"cniVersion\": \"{version}\"\n}}"
    );
    std::fs::write(dir.join(filename), &conf).expect("write config file");
    conf
}

/// Writes an attachment record the way the execution layer would have after
/// a successful ADD.
pub fn write_cache_file(
    cache_dir: &Path,
    container_id: &str,
    net_name: &str,
    ifname: &str,
    config: &str,
) {
    let record = serde_json::json!({
        "kind": "cniCacheV1",
        "config": BASE64.encode(config),
        "containerId": container_id,
        "ifName": ifname,
        "networkName": net_name,
        "result": {"cniVersion": "0.4.0"},
    });

    let results_dir = cache_dir.join("results");
    std::fs::create_dir_all(&results_dir).expect("create results dir");
    std::fs::write(
        results_dir.join(format!("{net_name}-{container_id}-{ifname}")),
        serde_json::to_vec(&record).expect("record serializes"),
    )
    .expect("write cache record");
}

/// Initializes a [`magiknet::CniPlugin`] over the scripted executor, in the
/// shape the lifecycle tests use everywhere: an empty `default_network`
/// string means "derive from filename sort order".
pub async fn init_cni(
    fake: std::sync::Arc<FakeExec>,
    cache_dir: &Path,
    default_network: &str,
    conf_dir: &Path,
    watch: bool,
    bin_dir: &Path,
) -> magiknet::CniPlugin {
    let config = magiknet::CniConfig {
        conf_dir: conf_dir.to_path_buf(),
        bin_dirs: vec![bin_dir.to_path_buf()],
        cache_dir: cache_dir.to_path_buf(),
        default_network: (!default_network.is_empty()).then(|| default_network.to_string()),
        watch,
    };
    magiknet::CniPlugin::init_with_exec(config, fake)
        .await
        .expect("plugin init")
}

/// Polls `plugin.status()` until its ok-ness matches `want_ok` or `timeout`
/// elapses.
pub async fn wait_for_status(
    plugin: &magiknet::CniPlugin,
    want_ok: bool,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if plugin.status().await.is_ok() == want_ok {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls a synchronous condition until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
