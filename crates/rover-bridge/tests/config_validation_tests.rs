use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use modbus_client::Transport;
use rover_bridge::{BridgeConfig, TransportKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("RENOGY_CONFIG", fixture_path("config-valid.toml"));

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.device.transport, TransportKind::Serial);
    assert_eq!(config.device.port, "/dev/ttyUSB0");
    assert_eq!(config.device.unit_id, Some(1));
    assert_eq!(config.device.serial_number.as_deref(), Some("RNG12345"));
    assert_eq!(config.modbus.timeout_ms, 800);
    assert_eq!(config.poller.poll_interval, Duration::from_secs(30));
    assert_eq!(config.poller.reconnect_after_failures, Some(10));
    assert_eq!(config.respawn_delay_ms, 2000);
    let mqtt = config.mqtt.as_ref().expect("mqtt enabled");
    assert_eq!(mqtt.host, "broker.local");
    assert_eq!(config.http_bind.as_deref(), Some("127.0.0.1:9108"));

    env::remove_var("RENOGY_CONFIG");
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("RENOGY_CONFIG", fixture_path("config-valid.json"));

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.device.transport, TransportKind::Tcp);
    assert!(!config.device.is_auto_port());
    assert!(config.mqtt.is_none());
    assert!(config.http_bind.is_none());
    assert_eq!(config.poller.unavailable_after_failures, 5);

    let client = config.client_config("ignored");
    assert_eq!(
        client.transport,
        Transport::Tcp {
            host: "10.0.0.40".to_string(),
            port: 502,
        }
    );

    env::remove_var("RENOGY_CONFIG");
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("RENOGY_CONFIG", fixture_path("config-invalid.toml"));

    let config = BridgeConfig::load().expect("load config");
    assert!(config.validate().is_err());

    env::remove_var("RENOGY_CONFIG");
}

#[test]
fn defaults_scan_for_port_and_address() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::remove_var("RENOGY_CONFIG");

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate defaults");

    assert!(config.device.is_auto_port());
    assert_eq!(config.device.unit_id, None);
    assert_eq!(config.discovery.scan_min_address, 1);
    assert_eq!(config.discovery.scan_max_address, 16);
    assert_eq!(config.poller.poll_interval, Duration::from_secs(3));

    let client = config.client_config("/dev/ttyUSB3");
    match client.transport {
        Transport::Serial { port, baud_rate, .. } => {
            assert_eq!(port, "/dev/ttyUSB3");
            assert_eq!(baud_rate, 9600);
        }
        Transport::Tcp { .. } => panic!("expected serial transport"),
    }
}

#[test]
fn env_overrides_file_values() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("RENOGY_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("RENOGY_UNIT_ID", "9");
    env::set_var("RENOGY_POLL_INTERVAL_MS", "5000");
    env::set_var("RENOGY_HTTP_BIND", "");

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.device.unit_id, Some(9));
    assert_eq!(config.poller.poll_interval, Duration::from_secs(5));
    assert!(config.http_bind.is_none());

    env::remove_var("RENOGY_CONFIG");
    env::remove_var("RENOGY_UNIT_ID");
    env::remove_var("RENOGY_POLL_INTERVAL_MS");
    env::remove_var("RENOGY_HTTP_BIND");
}

#[test]
fn explicit_path_wins_over_env() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("RENOGY_CONFIG", fixture_path("config-invalid.toml"));

    let config = BridgeConfig::load_with_path(Some(fixture_path("config-valid.json")))
        .expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.device.transport, TransportKind::Tcp);

    env::remove_var("RENOGY_CONFIG");
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
