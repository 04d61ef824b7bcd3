use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use discovery::DiscoveryConfig;
use hass_mqtt::MqttConfig;
use modbus_client::{ClientConfig, Transport};
use poller_actor::ActorConfig;

/// Serial port value that asks for the first detected port.
pub const AUTO_PORT: &str = "auto";

const DEFAULT_BAUD_RATE: u32 = 9_600;
const DEFAULT_TCP_PORT: u16 = 502;
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:9108";
const DEFAULT_RESPAWN_DELAY_MS: u64 = 5_000;
const MAX_UNIT_ID: u8 = 247;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Tcp,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: String,
    pub stop_bits: u8,
    pub host: String,
    pub tcp_port: u16,
    /// None means scan the discovery address range.
    pub unit_id: Option<u8>,
    /// When set, the identified controller must carry this serial number.
    pub serial_number: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            port: AUTO_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
            host: String::new(),
            tcp_port: DEFAULT_TCP_PORT,
            unit_id: None,
            serial_number: None,
        }
    }
}

impl DeviceConfig {
    pub fn is_auto_port(&self) -> bool {
        self.transport == TransportKind::Serial && self.port.eq_ignore_ascii_case(AUTO_PORT)
    }

    pub fn transport_for(&self, port: &str) -> Transport {
        match self.transport {
            TransportKind::Serial => Transport::Serial {
                port: port.to_string(),
                baud_rate: self.baud_rate,
                data_bits: self.data_bits,
                parity: self.parity.clone(),
                stop_bits: self.stop_bits,
            },
            TransportKind::Tcp => Transport::Tcp {
                host: self.host.clone(),
                port: self.tcp_port,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub discovery: DiscoveryConfig,
    pub modbus: ClientConfig,
    pub poller: ActorConfig,
    /// None runs the publisher in log-only mode.
    pub mqtt: Option<MqttConfig>,
    /// None disables the status server.
    pub http_bind: Option<String>,
    pub respawn_delay_ms: u64,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Modbus settings with the transport resolved against `port` (only used for serial).
    pub fn client_config(&self, port: &str) -> ClientConfig {
        let mut client = self.modbus.clone();
        client.transport = self.device.transport_for(port);
        client
    }

    pub fn validate(&self) -> Result<()> {
        match self.device.transport {
            TransportKind::Serial => {
                if self.device.port.trim().is_empty() {
                    anyhow::bail!("device.port must be a serial port path or \"auto\"");
                }
                if self.device.baud_rate == 0 {
                    anyhow::bail!("device.baud_rate must be >= 1");
                }
                if !(5..=8).contains(&self.device.data_bits) {
                    anyhow::bail!("device.data_bits must be between 5 and 8");
                }
                if !matches!(self.device.stop_bits, 1 | 2) {
                    anyhow::bail!("device.stop_bits must be 1 or 2");
                }
                if !matches!(
                    self.device.parity.to_ascii_lowercase().as_str(),
                    "none" | "even" | "odd"
                ) {
                    anyhow::bail!("device.parity must be none, even or odd");
                }
            }
            TransportKind::Tcp => {
                if self.device.host.trim().is_empty() {
                    anyhow::bail!("device.host is required for tcp transport");
                }
                if self.device.tcp_port == 0 {
                    anyhow::bail!("device.tcp_port must be between 1 and 65535");
                }
            }
        }
        if let Some(unit_id) = self.device.unit_id {
            validate_unit_id("device.unit_id", unit_id)?;
        }
        if let Some(ref serial) = self.device.serial_number {
            if serial.trim().is_empty() {
                anyhow::bail!("device.serial_number must be non-empty when set");
            }
        }
        validate_unit_id("discovery.scan_min_address", self.discovery.scan_min_address)?;
        validate_unit_id("discovery.scan_max_address", self.discovery.scan_max_address)?;
        if self.discovery.scan_min_address > self.discovery.scan_max_address {
            anyhow::bail!("discovery.scan_min_address must be <= discovery.scan_max_address");
        }
        if self.poller.poll_interval.as_millis() == 0 {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        if self.poller.unavailable_after_failures == 0 {
            anyhow::bail!("poller.unavailable_after_failures must be >= 1");
        }
        if self.poller.reconnect_after_failures == Some(0) {
            anyhow::bail!("poller.reconnect_after_failures must be >= 1 when set");
        }
        if let Some(max_batch) = self.modbus.max_batch_size {
            if max_batch == 0 {
                anyhow::bail!("modbus.max_batch_size must be >= 1");
            }
            if max_batch > 125 {
                anyhow::bail!("modbus.max_batch_size must be <= 125");
            }
        }
        if self.modbus.timeout_ms == 0 {
            anyhow::bail!("modbus.timeout_ms must be >= 1");
        }
        if self.modbus.retry_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_backoff_ms must be >= 1");
        }
        if self.modbus.retry_max_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_max_backoff_ms must be >= 1");
        }
        if let Some(delay) = self.modbus.inter_read_delay_ms {
            if delay == 0 {
                anyhow::bail!("modbus.inter_read_delay_ms must be >= 1 when set");
            }
        }
        if let Some(ref mqtt) = self.mqtt {
            if mqtt.host.trim().is_empty() {
                anyhow::bail!("mqtt.host must be non-empty");
            }
            if mqtt.port == 0 {
                anyhow::bail!("mqtt.port must be between 1 and 65535");
            }
            if mqtt.client_id.trim().is_empty() {
                anyhow::bail!("mqtt.client_id must be non-empty");
            }
            if mqtt.username.is_some() != mqtt.password.is_some() {
                anyhow::bail!("mqtt.username and mqtt.password must be set together");
            }
            validate_topic("mqtt.discovery_prefix", &mqtt.discovery_prefix)?;
            validate_topic("mqtt.base_topic", &mqtt.base_topic)?;
        }
        if let Some(ref bind) = self.http_bind {
            bind.parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("http.bind must be an address like 0.0.0.0:9108"))?;
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("respawn_delay_ms must be >= 1");
        }

        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            discovery: DiscoveryConfig::default(),
            modbus: ClientConfig::default(),
            poller: ActorConfig::default(),
            mqtt: None,
            http_bind: Some(DEFAULT_HTTP_BIND.to_string()),
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
        }
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Some(kind) = env::var("RENOGY_TRANSPORT").ok().and_then(|value| parse_transport(&value)) {
        config.device.transport = kind;
    }
    if let Ok(value) = env::var("RENOGY_PORT") {
        config.device.port = value;
    }
    if let Some(baud) = parse_env("RENOGY_BAUD_RATE") {
        config.device.baud_rate = baud;
    }
    if let Ok(value) = env::var("RENOGY_HOST") {
        config.device.host = value;
    }
    if let Some(port) = parse_env("RENOGY_TCP_PORT") {
        config.device.tcp_port = port;
    }
    config.device.unit_id = parse_env("RENOGY_UNIT_ID").or(config.device.unit_id);
    config.device.serial_number = env::var("RENOGY_SERIAL_NUMBER")
        .ok()
        .or(config.device.serial_number.take());

    if let Some(interval_ms) = parse_env::<u64>("RENOGY_POLL_INTERVAL_MS") {
        config.poller.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(jitter_ms) = parse_env("RENOGY_JITTER_MS") {
        config.poller.jitter_ms = jitter_ms;
    }
    if let Some(failures) = parse_env("RENOGY_UNAVAILABLE_AFTER") {
        config.poller.unavailable_after_failures = failures;
    }

    if let Some(timeout_ms) = parse_env("RENOGY_MODBUS_TIMEOUT_MS") {
        config.modbus.timeout_ms = timeout_ms;
    }
    if let Some(max_batch) = parse_env("RENOGY_MAX_BATCH_SIZE") {
        config.modbus.max_batch_size = Some(max_batch);
    }

    if let Ok(host) = env::var("RENOGY_MQTT_HOST") {
        config.mqtt.get_or_insert_with(MqttConfig::default).host = host;
    }
    if let Some(mqtt) = config.mqtt.as_mut() {
        if let Some(port) = parse_env("RENOGY_MQTT_PORT") {
            mqtt.port = port;
        }
        mqtt.username = env::var("RENOGY_MQTT_USERNAME").ok().or(mqtt.username.take());
        mqtt.password = env::var("RENOGY_MQTT_PASSWORD").ok().or(mqtt.password.take());
        if let Ok(client_id) = env::var("RENOGY_MQTT_CLIENT_ID") {
            mqtt.client_id = client_id;
        }
        if let Ok(prefix) = env::var("RENOGY_DISCOVERY_PREFIX") {
            mqtt.discovery_prefix = prefix;
        }
        if let Ok(base) = env::var("RENOGY_BASE_TOPIC") {
            mqtt.base_topic = base;
        }
    }

    if let Ok(bind) = env::var("RENOGY_HTTP_BIND") {
        config.http_bind = if bind.trim().is_empty() { None } else { Some(bind) };
    }
    config.respawn_delay_ms =
        parse_env("RENOGY_RESPAWN_DELAY_MS").unwrap_or(config.respawn_delay_ms);
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    device: Option<FileDeviceConfig>,
    discovery: Option<FileDiscoveryConfig>,
    modbus: Option<FileModbusConfig>,
    poller: Option<FilePollerConfig>,
    mqtt: Option<FileMqttConfig>,
    http: Option<FileHttpConfig>,
    respawn_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    transport: Option<String>,
    port: Option<String>,
    baud_rate: Option<u32>,
    data_bits: Option<u8>,
    parity: Option<String>,
    stop_bits: Option<u8>,
    host: Option<String>,
    tcp_port: Option<u16>,
    unit_id: Option<u8>,
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileDiscoveryConfig {
    scan_min_address: Option<u8>,
    scan_max_address: Option<u8>,
    by_id_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    max_batch_size: Option<u16>,
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    inter_read_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
    unavailable_after_failures: Option<u32>,
    reconnect_after_failures: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileMqttConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    discovery_prefix: Option<String>,
    base_topic: Option<String>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileHttpConfig {
    enabled: Option<bool>,
    bind: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("RENOGY_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(device) = file.device {
        if let Some(transport) = device.transport {
            match parse_transport(&transport) {
                Some(kind) => config.device.transport = kind,
                None => warn!(transport = %transport, "unknown device.transport ignored"),
            }
        }
        if let Some(port) = device.port {
            config.device.port = port;
        }
        if let Some(baud) = device.baud_rate {
            config.device.baud_rate = baud;
        }
        if let Some(bits) = device.data_bits {
            config.device.data_bits = bits;
        }
        if let Some(parity) = device.parity {
            config.device.parity = parity;
        }
        if let Some(bits) = device.stop_bits {
            config.device.stop_bits = bits;
        }
        if let Some(host) = device.host {
            config.device.host = host;
        }
        if let Some(port) = device.tcp_port {
            config.device.tcp_port = port;
        }
        if let Some(unit_id) = device.unit_id {
            config.device.unit_id = Some(unit_id);
        }
        if let Some(serial) = device.serial_number {
            config.device.serial_number = Some(serial);
        }
    }

    if let Some(discovery) = file.discovery {
        if let Some(min) = discovery.scan_min_address {
            config.discovery.scan_min_address = min;
        }
        if let Some(max) = discovery.scan_max_address {
            config.discovery.scan_max_address = max;
        }
        if let Some(dir) = discovery.by_id_dir {
            config.discovery.by_id_dir = dir;
        }
    }

    if let Some(modbus) = file.modbus {
        if let Some(max_batch) = modbus.max_batch_size {
            config.modbus.max_batch_size = Some(max_batch);
        }
        if let Some(timeout_ms) = modbus.timeout_ms {
            config.modbus.timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = modbus.retry_count {
            config.modbus.retry_count = retry_count;
        }
        if let Some(backoff) = modbus.retry_backoff_ms {
            config.modbus.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = modbus.retry_max_backoff_ms {
            config.modbus.retry_max_backoff_ms = max_backoff;
        }
        if let Some(delay) = modbus.inter_read_delay_ms {
            config.modbus.inter_read_delay_ms = Some(delay);
        }
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poller.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = poller.jitter_ms {
            config.poller.jitter_ms = jitter_ms;
        }
        if let Some(failures) = poller.unavailable_after_failures {
            config.poller.unavailable_after_failures = failures;
        }
        if let Some(failures) = poller.reconnect_after_failures {
            config.poller.reconnect_after_failures = Some(failures);
        }
    }

    if let Some(mqtt) = file.mqtt {
        if mqtt.enabled == Some(false) {
            config.mqtt = None;
        } else {
            let target = config.mqtt.get_or_insert_with(MqttConfig::default);
            if let Some(host) = mqtt.host {
                target.host = host;
            }
            if let Some(port) = mqtt.port {
                target.port = port;
            }
            if let Some(client_id) = mqtt.client_id {
                target.client_id = client_id;
            }
            if let Some(username) = mqtt.username {
                target.username = Some(username);
            }
            if let Some(password) = mqtt.password {
                target.password = Some(password);
            }
            if let Some(prefix) = mqtt.discovery_prefix {
                target.discovery_prefix = prefix;
            }
            if let Some(base) = mqtt.base_topic {
                target.base_topic = base;
            }
            if let Some(keep_alive) = mqtt.keep_alive_secs {
                target.keep_alive_secs = keep_alive;
            }
        }
    }

    if let Some(http) = file.http {
        if http.enabled == Some(false) {
            config.http_bind = None;
        } else if let Some(bind) = http.bind {
            config.http_bind = Some(bind);
        }
    }

    if let Some(delay) = file.respawn_delay_ms {
        config.respawn_delay_ms = delay;
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_transport(value: &str) -> Option<TransportKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "serial" | "uart" | "rtu" => Some(TransportKind::Serial),
        "tcp" => Some(TransportKind::Tcp),
        _ => None,
    }
}

fn validate_unit_id(field: &str, unit_id: u8) -> Result<()> {
    if unit_id == 0 || unit_id > MAX_UNIT_ID {
        anyhow::bail!("{field} must be between 1 and {MAX_UNIT_ID}");
    }
    Ok(())
}

fn validate_topic(field: &str, topic: &str) -> Result<()> {
    let trimmed = topic.trim_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("{field} must be non-empty");
    }
    if topic.contains(['+', '#']) {
        anyhow::bail!("{field} must not contain MQTT wildcards");
    }
    if topic.chars().any(char::is_whitespace) {
        anyhow::bail!("{field} must not contain whitespace");
    }
    Ok(())
}
