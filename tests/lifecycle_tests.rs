//! End-to-end lifecycle tests over a scripted plugin executor.
//!
//! Covers default-network discovery (static and asynchronous), registry
//! reloads, attach/detach round trips, partial-attach unwinding, GC
//! payloads, and readiness reporting.

mod common;

use common::{FakeExec, init_cni, wait_for_status, wait_until, write_config};
use magiknet::{Error, NetAttachment, PodNetwork};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn pod(id: &str, networks: Vec<NetAttachment>) -> PodNetwork {
    PodNetwork {
        namespace: "namespace1".to_string(),
        name: "pod1".to_string(),
        id: id.to_string(),
        uid: "9414bd03-b3d3-453e-9d9f-47dcee07958c".to_string(),
        // Host-network shape: loopback setup is skipped, which keeps these
        // tests independent of namespace privileges.
        netns: String::new(),
        networks,
        ..Default::default()
    }
}

fn default_bin() -> &'static Path {
    Path::new("/opt/cni/bin")
}

// =============================================================================
// Default-Network Discovery
// =============================================================================

#[tokio::test]
async fn test_finds_existing_default_network() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "5-notdefault.conf", "notdefault", "myplugin", "0.3.1");
    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    plugin.status().await.unwrap();
    assert!(plugin.is_ready());

    let default = plugin.default_network().unwrap();
    assert_eq!(default.name, "test");
    assert!(!default.config.plugins.is_empty());
    assert_eq!(default.config.plugins[0].plugin_type, "myplugin");

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovers_default_network_asynchronously() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    assert!(plugin.status().await.is_err());

    // A config that does not match the default keeps status failing.
    write_config(conf_dir.path(), "5-notdefault.conf", "notdefault", "myplugin", "0.3.1");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(plugin.status().await.is_err());

    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");
    assert!(
        wait_for_status(&plugin, true, DISCOVERY_TIMEOUT).await,
        "default network should be discovered within the resync window"
    );

    let default = plugin.default_network().unwrap();
    assert_eq!(default.name, "test");
    assert_eq!(default.config.plugins[0].plugin_type, "myplugin");

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_becomes_ready_when_plugin_binary_appears() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let bin_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    fake.set_fail_find(true);

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        true,
        bin_dir.path(),
    )
    .await;

    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(plugin.status().await.is_err());

    // The binary shows up: the bin-dir watcher (or the periodic resync)
    // re-validates, and readiness follows without a config-directory event.
    fake.set_fail_find(false);
    std::fs::write(bin_dir.path().join("myplugin"), b"#!binary").unwrap();

    assert!(wait_for_status(&plugin, true, Duration::from_secs(10)).await);
    let default = plugin.default_network().unwrap();
    assert_eq!(default.name, "test");

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reloads_default_when_config_changes_unnamed_default() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "5-notdefault.conf", "notdefault", "myplugin", "0.3.1");
    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    plugin.status().await.unwrap();
    assert_eq!(plugin.default_network().unwrap().name, "test");

    // Rewriting the file renames the network; the derived default follows.
    write_config(conf_dir.path(), "10-test.conf", "secondary", "testplugin", "0.3.1");
    assert!(
        wait_until(DISCOVERY_TIMEOUT, || {
            plugin
                .default_network()
                .is_some_and(|net| net.name == "secondary")
        })
        .await
    );
    assert!(plugin.status().await.is_ok());
    assert_eq!(
        plugin.default_network().unwrap().config.plugins[0].plugin_type,
        "testplugin"
    );

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reloads_default_in_place_when_named() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    plugin.status().await.unwrap();
    assert_eq!(
        plugin.default_network().unwrap().config.plugins[0].plugin_type,
        "myplugin"
    );

    write_config(conf_dir.path(), "10-test.conf", "test", "testplugin", "0.3.1");
    assert!(
        wait_until(DISCOVERY_TIMEOUT, || {
            plugin
                .default_network()
                .is_some_and(|net| net.config.plugins[0].plugin_type == "testplugin")
        })
        .await
    );
    assert_eq!(plugin.default_network().unwrap().name, "test");

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refinds_default_after_delete_and_rewrite() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    assert!(plugin.status().await.is_err());

    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.3.1");
    assert!(wait_for_status(&plugin, true, DISCOVERY_TIMEOUT).await);

    // Deleting the default's file flips status back to failing.
    std::fs::remove_file(conf_dir.path().join("10-test.conf")).unwrap();
    assert!(wait_for_status(&plugin, false, DISCOVERY_TIMEOUT).await);

    // Rewriting it at a STATUS-capable version restores readiness and
    // exercises the live probe.
    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "1.1.0");
    assert!(wait_for_status(&plugin, true, DISCOVERY_TIMEOUT).await);

    fake.set_fail_status(true);
    assert!(plugin.status().await.is_err());
    assert!(!plugin.is_ready());

    fake.set_fail_status(false);
    plugin.status().await.unwrap();
    assert!(plugin.is_ready());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_asciibetical_default_tracks_new_files() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    write_config(conf_dir.path(), "15-test.conf", "test", "myplugin", "0.3.1");
    write_config(conf_dir.path(), "5-notdefault.conf", "notdefault", "myplugin", "0.3.1");

    assert!(wait_for_status(&plugin, true, DISCOVERY_TIMEOUT).await);
    assert_eq!(plugin.default_network().unwrap().name, "test");

    // A file sorting earlier than the current default takes over.
    write_config(conf_dir.path(), "10-abc.conf", "newdefault", "myplugin", "0.3.1");
    assert!(
        wait_until(DISCOVERY_TIMEOUT, || {
            plugin
                .default_network()
                .is_some_and(|net| net.name == "newdefault")
        })
        .await
    );
    assert!(plugin.status().await.is_ok());

    plugin.shutdown().await.unwrap();
}

// =============================================================================
// Attach / Detach
// =============================================================================

#[tokio::test]
async fn test_sets_up_and_tears_down_default_network() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let conf = write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "0.3.1");

    let expected = json!({
        "cniVersion": "0.3.1",
        "interfaces": [
            {"name": "eth0", "mac": "01:23:45:67:89:01", "sandbox": "/var/run/netns/pod1"}
        ],
        "ips": [
            {"interface": 0, "version": "4", "address": "1.1.1.2/24"}
        ]
    });

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(Vec::new(), Some(&conf), Some(expected.clone()));

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    let pod_net = pod("1234567890", Vec::new());
    let results = plugin.set_up_pod(&pod_net).await.unwrap();

    assert_eq!(fake.adds(), fake.plugin_count());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "network2");
    assert_eq!(results[0].ifname, "eth0");
    assert_eq!(results[0].result, expected);

    plugin.tear_down_pod(&pod_net).await.unwrap();
    assert_eq!(fake.dels(), fake.plugin_count());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sets_up_specified_networks_in_order() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "0.4.0");
    let conf1 = write_config(conf_dir.path(), "20-network3.conf", "network3", "myplugin", "0.4.0");
    let conf2 = write_config(conf_dir.path(), "30-network4.conf", "network4", "myplugin", "0.4.0");

    let expected1 = json!({
        "cniVersion": "0.4.0",
        "interfaces": [
            {"name": "eth0", "mac": "01:23:45:67:89:01", "sandbox": "/var/run/netns/pod1"}
        ],
        "ips": [{"interface": 0, "version": "4", "address": "1.1.1.2/24"}]
    });
    let expected2 = json!({
        "cniVersion": "0.4.0",
        "interfaces": [
            {"name": "eth1", "mac": "01:23:45:67:89:02", "sandbox": "/var/run/netns/pod1"}
        ],
        "ips": [{"interface": 0, "version": "4", "address": "1.1.1.3/24"}]
    });

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(
        vec![("CNI_IFNAME".to_string(), "eth0".to_string())],
        Some(&conf1),
        Some(expected1.clone()),
    );
    fake.add_plugin(
        vec![("CNI_IFNAME".to_string(), "eth1".to_string())],
        Some(&conf2),
        Some(expected2.clone()),
    );

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    let pod_net = pod(
        "1234567890",
        vec![NetAttachment::new("network3"), NetAttachment::new("network4")],
    );
    let results = plugin.set_up_pod(&pod_net).await.unwrap();

    assert_eq!(fake.adds(), fake.plugin_count());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result, expected1);
    assert_eq!(results[1].result, expected2);

    // Status reads the recorded results back, order preserved.
    let status = plugin.pod_network_status(&pod_net).await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].result, expected1);
    assert_eq!(status[1].result, expected2);

    plugin.tear_down_pod(&pod_net).await.unwrap();
    assert_eq!(fake.dels(), fake.plugin_count());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_setup_unwinds_in_reverse() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let conf1 = write_config(conf_dir.path(), "20-network3.conf", "network3", "myplugin", "0.4.0");
    write_config(conf_dir.path(), "30-network4.conf", "network4", "myplugin", "0.4.0");

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(
        Vec::new(),
        Some(&conf1),
        Some(json!({"cniVersion": "0.4.0", "ips": []})),
    );
    fake.add_failing_plugin("no ip addresses available");

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let pod_net = pod(
        "1234567890",
        vec![NetAttachment::new("network3"), NetAttachment::new("network4")],
    );
    let err = plugin.set_up_pod(&pod_net).await.unwrap_err();

    assert!(matches!(err, Error::PartialSetUp { ref network, .. } if network == "network4"));
    // Both ADDs ran; failure at the second triggers exactly one rollback
    // DEL, for the first attachment.
    assert_eq!(fake.adds(), 2);
    assert_eq!(fake.dels(), 1);

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_network_invokes_no_plugin() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-test.conf", "test", "myplugin", "0.4.0");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "test",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let pod_net = pod("1234567890", vec![NetAttachment::new("missing")]);
    let err = plugin.set_up_pod(&pod_net).await.unwrap_err();

    assert!(matches!(err, Error::UnknownNetwork(ref name) if name == "missing"));
    assert_eq!(fake.adds(), 0);

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_interface_rejected_before_any_plugin() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-a.conf", "net-a", "myplugin", "0.4.0");
    write_config(conf_dir.path(), "20-b.conf", "net-b", "myplugin", "0.4.0");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let pod_net = pod(
        "1234567890",
        vec![
            NetAttachment::with_ifname("net-a", "eth0"),
            NetAttachment::new("net-b"),
        ],
    );
    let err = plugin.set_up_pod(&pod_net).await.unwrap_err();

    assert!(matches!(err, Error::DuplicateInterface { ref ifname, .. } if ifname == "eth0"));
    assert_eq!(fake.adds(), 0);

    plugin.shutdown().await.unwrap();
}

// =============================================================================
// Readiness Boundaries
// =============================================================================

#[tokio::test]
async fn test_status_not_ready_on_empty_directory() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let err = plugin.status().await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
    assert!(!plugin.is_ready());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_setup_without_default_is_not_ready() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let err = plugin.set_up_pod(&pod("1234567890", Vec::new())).await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
    assert_eq!(fake.adds(), 0);

    plugin.shutdown().await.unwrap();
}

// =============================================================================
// Garbage Collection
// =============================================================================

#[tokio::test]
async fn test_gc_default_network_payload() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "1.1.0");

    let expected_conf = r#"{
        "name": "network2",
        "type": "myplugin",
        "cniVersion": "1.1.0",
        "cni.dev/valid-attachments": [{"containerID": "1234567890", "ifname": "eth0"}]
    }"#;

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(Vec::new(), Some(expected_conf), None);

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    let pod_net = pod("1234567890", Vec::new());
    plugin.gc(&[pod_net]).await.unwrap();
    assert_eq!(fake.gcs(), fake.plugin_count());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gc_specified_network_keeps_ifname() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "1.1.0");

    let expected_conf = r#"{
        "name": "network2",
        "type": "myplugin",
        "cniVersion": "1.1.0",
        "cni.dev/valid-attachments": [{"containerID": "1234567890", "ifname": "net1"}]
    }"#;

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(Vec::new(), Some(expected_conf), None);

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    let pod_net = pod(
        "1234567890",
        vec![NetAttachment::with_ifname("network2", "net1")],
    );
    plugin.gc(&[pod_net]).await.unwrap();
    assert_eq!(fake.gcs(), fake.plugin_count());

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gc_drops_unknown_networks_from_payload() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "1.1.0");

    // The pod references a network the registry does not know; the GC for
    // network2 must carry an empty valid-attachment list.
    let expected_conf = r#"{
        "name": "network2",
        "type": "myplugin",
        "cniVersion": "1.1.0",
        "cni.dev/valid-attachments": []
    }"#;

    let fake = Arc::new(FakeExec::new());
    fake.add_plugin(Vec::new(), Some(expected_conf), None);

    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    let pod_net = pod("1234567890", vec![NetAttachment::new("vanished")]);
    plugin.gc(&[pod_net]).await.unwrap();
    assert_eq!(fake.gcs(), 1);

    plugin.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gc_skips_pre_gc_versions() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_config(conf_dir.path(), "10-network2.conf", "network2", "myplugin", "0.4.0");

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "network2",
        conf_dir.path(),
        false,
        default_bin(),
    )
    .await;

    let pod_net = pod("1234567890", Vec::new());
    plugin.gc(&[pod_net]).await.unwrap();
    assert_eq!(fake.gcs(), 0);

    plugin.shutdown().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let conf_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let fake = Arc::new(FakeExec::new());
    let plugin = init_cni(
        Arc::clone(&fake),
        cache_dir.path(),
        "",
        conf_dir.path(),
        true,
        default_bin(),
    )
    .await;

    plugin.shutdown().await.unwrap();
    plugin.shutdown().await.unwrap();
}
