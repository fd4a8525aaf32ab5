use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::{PartialClusterSettings, PartialSettings, Settings};
use super::{load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.node.host, "127.0.0.1");
    assert_eq!(settings.node.port, 7676);
    assert_eq!(settings.cluster.consumer_flow_limit, 1000);
    assert_eq!(settings.cluster.pending_check_interval_secs, 180);
    assert!(!settings.cluster.enforce_remote_destination_limit);
    assert_eq!(settings.cluster.transport, "websocket");
    assert!(settings.destinations.auto_create_queues);
}

#[test]
fn merge_only_overrides_given_fields() {
    let partial = PartialSettings {
        cluster: Some(PartialClusterSettings {
            consumer_flow_limit: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };
    let merged = Settings::default().merge(partial);
    assert_eq!(merged.cluster.consumer_flow_limit, 10);
    assert_eq!(merged.cluster.ack_wait_timeout_secs, 180);
    assert_eq!(merged.node, Settings::default().node);
}

#[test]
fn pending_check_never_below_ack_timeout() {
    let mut settings = Settings::default();
    settings.cluster.pending_check_interval_secs = 5;
    settings.cluster.ack_wait_timeout_secs = 30;
    assert_eq!(
        settings.cluster.pending_check_interval(),
        std::time::Duration::from_secs(30)
    );
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("node.toml");
    let toml = r#"
        [node]
        instance = "broker-b"
        port = 9000

        [cluster]
        peers = ["ws://10.0.0.2:7676"]
        enforce_remote_destination_limit = true

        [destinations]
        auto_create_topics = false
        max_messages = 50
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().expect("utf8 path")).expect("load_config failed");
    assert_eq!(cfg.node.instance, "broker-b");
    assert_eq!(cfg.node.port, 9000);
    assert_eq!(cfg.node.host, "127.0.0.1");
    assert_eq!(cfg.cluster.peers, vec!["ws://10.0.0.2:7676".to_string()]);
    assert!(cfg.cluster.enforce_remote_destination_limit);
    assert!(!cfg.destinations.auto_create_topics);
    assert_eq!(cfg.destinations.max_messages, Some(50));
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("CLUSTERMQ__NODE__PORT", Some("7700")),
            ("CLUSTERMQ__LOGGING__LEVEL", Some("debug")),
            ("CLUSTERMQ__CLUSTER__PEERS", Some("ws://a:1,ws://b:2")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.node.port, 7700);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.cluster.peers, vec!["ws://a:1", "ws://b:2"]);
        },
    );
}
