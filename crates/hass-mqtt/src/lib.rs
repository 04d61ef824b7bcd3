use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use entities::{unique_id, SensorDescription, UNIQUE_ID_PREFIX};
use poller_actor::PollState;
use types::{ControllerReading, DeviceInfo};

pub const MANUFACTURER: &str = "Renogy";
pub const DEFAULT_DEVICE_NAME: &str = "Rover";
pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Messages a mock publisher remembers; older ones are dropped first.
pub const MOCK_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
    pub base_topic: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "renogy-rover-bridge".to_string(),
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
            base_topic: "renogy_rover".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("json encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Topic layout for one controller, keyed by its serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    discovery_prefix: String,
    base_topic: String,
    node_id: String,
    serial_number: String,
}

impl Topics {
    pub fn new(discovery_prefix: &str, base_topic: &str, serial_number: &str) -> Self {
        Self {
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            base_topic: base_topic.trim_end_matches('/').to_string(),
            node_id: format!("{UNIQUE_ID_PREFIX}_{serial_number}"),
            serial_number: serial_number.to_string(),
        }
    }

    pub fn discovery(&self, sensor: &SensorDescription) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.discovery_prefix, self.node_id, sensor.key
        )
    }

    pub fn state(&self) -> String {
        format!("{}/{}/state", self.base_topic, self.serial_number)
    }

    pub fn availability(&self) -> String {
        format!("{}/{}/availability", self.base_topic, self.serial_number)
    }

    /// Home Assistant announces its own restarts here.
    pub fn hass_status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// "Renogy Rover RNG-CTRL-RVR40"; the model is dropped when the controller reports none.
pub fn device_name(device: &DeviceInfo) -> String {
    if device.model.is_empty() {
        format!("{MANUFACTURER} {DEFAULT_DEVICE_NAME}")
    } else {
        format!("{MANUFACTURER} {DEFAULT_DEVICE_NAME} {}", device.model)
    }
}

/// Retained discovery configs, one per sensor.
pub fn discovery_messages(
    topics: &Topics,
    device: &DeviceInfo,
    sensors: &[SensorDescription],
) -> Result<Vec<MqttMessage>, PublishError> {
    let device_block = json!({
        "identifiers": [topics.node_id],
        "manufacturer": MANUFACTURER,
        "model": device.model,
        "name": device_name(device),
        "sw_version": device.software_version,
        "hw_version": device.hardware_version,
        "serial_number": device.serial_number,
    });

    sensors
        .iter()
        .map(|sensor| {
            let id = unique_id(&device.serial_number, sensor.key);
            let mut config = Map::new();
            config.insert("name".into(), json!(sensor.name));
            config.insert("unique_id".into(), json!(id));
            config.insert("object_id".into(), json!(id));
            config.insert("state_topic".into(), json!(topics.state()));
            config.insert(
                "value_template".into(),
                json!(format!("{{{{ value_json.{} }}}}", sensor.key)),
            );
            config.insert("availability_topic".into(), json!(topics.availability()));
            config.insert("payload_available".into(), json!(ONLINE));
            config.insert("payload_not_available".into(), json!(OFFLINE));
            if let Some(unit) = sensor.unit {
                config.insert("unit_of_measurement".into(), json!(unit));
            }
            if let Some(class) = sensor.device_class {
                config.insert("device_class".into(), serde_json::to_value(class)?);
            }
            if let Some(class) = sensor.state_class {
                config.insert("state_class".into(), serde_json::to_value(class)?);
            }
            if let Some(icon) = sensor.icon {
                config.insert("icon".into(), json!(icon));
            }
            if let Some(options) = sensor.options {
                config.insert("options".into(), json!(options));
            }
            if let Some(category) = sensor.entity_category {
                config.insert("entity_category".into(), serde_json::to_value(category)?);
            }
            config.insert("device".into(), device_block.clone());

            Ok(MqttMessage {
                topic: topics.discovery(sensor),
                payload: serde_json::to_string(&Value::Object(config))?,
                retain: true,
            })
        })
        .collect()
}

/// One JSON object carrying every sensor value, matched by the discovery `value_template`s.
pub fn state_message(
    topics: &Topics,
    reading: &ControllerReading,
    sensors: &[SensorDescription],
) -> Result<MqttMessage, PublishError> {
    let mut payload = Map::new();
    for sensor in sensors {
        payload.insert(
            sensor.key.as_str().to_string(),
            serde_json::to_value(sensor.state(reading))?,
        );
    }
    payload.insert("collected_at_ms".into(), json!(reading.collected_at_ms));

    Ok(MqttMessage {
        topic: topics.state(),
        payload: serde_json::to_string(&Value::Object(payload))?,
        retain: true,
    })
}

pub fn availability_message(topics: &Topics, available: bool) -> MqttMessage {
    MqttMessage {
        topic: topics.availability(),
        payload: if available { ONLINE } else { OFFLINE }.to_string(),
        retain: true,
    }
}

/// Something on the broker side that calls for re-sending discovery configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    HassOnline,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    client: Option<AsyncClient>,
    topics: Topics,
    sensors: &'static [SensorDescription],
    /// Filled only in mock mode.
    sent: Arc<Mutex<VecDeque<MqttMessage>>>,
}

impl Publisher {
    /// Logs instead of publishing; keeps what would have been sent.
    pub fn new_mock(topics: Topics, sensors: &'static [SensorDescription]) -> Self {
        Self {
            client: None,
            topics,
            sensors,
            sent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Connects to the broker and spawns the event loop driver.
    pub fn connect(
        config: &MqttConfig,
        topics: Topics,
        sensors: &'static [SensorDescription],
    ) -> (Self, mpsc::Receiver<BrokerEvent>, JoinHandle<()>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics.availability(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (events_tx, events_rx) = mpsc::channel(8);
        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            topics.hass_status(),
            events_tx,
        ));
        info!(host = %config.host, port = config.port, "mqtt client started");

        let publisher = Self {
            client: Some(client),
            topics,
            sensors,
            sent: Arc::new(Mutex::new(VecDeque::new())),
        };
        (publisher, events_rx, handle)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub async fn publish(&self, message: &MqttMessage) -> Result<(), PublishError> {
        match &self.client {
            Some(client) => {
                client
                    .publish(
                        message.topic.as_str(),
                        QoS::AtLeastOnce,
                        message.retain,
                        message.payload.clone().into_bytes(),
                    )
                    .await?;
                debug!(topic = %message.topic, bytes = message.payload.len(), "mqtt publish");
            }
            None => {
                info!(topic = %message.topic, bytes = message.payload.len(), "mock publish invoked");
                let mut sent = self.sent.lock().unwrap_or_else(|err| err.into_inner());
                if sent.len() == MOCK_LOG_CAPACITY {
                    sent.pop_front();
                }
                sent.push_back(message.clone());
            }
        }
        Ok(())
    }

    pub async fn announce(&self, device: &DeviceInfo) -> Result<(), PublishError> {
        for message in discovery_messages(&self.topics, device, self.sensors)? {
            self.publish(&message).await?;
        }
        info!(serial = %device.serial_number, sensors = self.sensors.len(), "discovery configs published");
        Ok(())
    }

    pub async fn publish_state(&self, state: &PollState) -> Result<(), PublishError> {
        self.publish(&availability_message(&self.topics, state.available))
            .await?;
        if let Some(reading) = &state.reading {
            self.publish(&state_message(&self.topics, reading, self.sensors)?)
                .await?;
        }
        Ok(())
    }

    /// The last [`MOCK_LOG_CAPACITY`] messages swallowed in mock mode, oldest first. Always empty with a broker.
    pub fn sent(&self) -> Vec<MqttMessage> {
        self.sent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Pushes state changes until shutdown, re-announcing when the broker or Home Assistant restarts.
    pub async fn run(
        self,
        device: DeviceInfo,
        mut state: watch::Receiver<PollState>,
        mut events: mpsc::Receiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(err) = self.announce(&device).await {
            warn!(error = %err, "discovery publish failed");
        }
        let mut last_available = None;
        let mut last_collected = None;

        loop {
            let snapshot = state.borrow_and_update().clone();
            if last_available != Some(snapshot.available) {
                if let Err(err) = self
                    .publish(&availability_message(&self.topics, snapshot.available))
                    .await
                {
                    warn!(error = %err, "availability publish failed");
                } else {
                    last_available = Some(snapshot.available);
                }
            }
            if let Some(reading) = &snapshot.reading {
                if last_collected != Some(reading.collected_at_ms) {
                    match state_message(&self.topics, reading, self.sensors) {
                        Ok(message) => match self.publish(&message).await {
                            Ok(()) => last_collected = Some(reading.collected_at_ms),
                            Err(err) => warn!(error = %err, "state publish failed"),
                        },
                        Err(err) => warn!(error = %err, "state encode failed"),
                    }
                }
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        info!("poll state channel closed");
                        break;
                    }
                }
                Some(event) = events.recv() => {
                    info!(?event, "re-announcing sensors");
                    if let Err(err) = self.announce(&device).await {
                        warn!(error = %err, "discovery publish failed");
                    }
                    last_available = None;
                    last_collected = None;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("publisher shutdown requested");
                        break;
                    }
                }
            }
        }

        if let Err(err) = self.publish(&availability_message(&self.topics, false)).await {
            warn!(error = %err, "offline publish failed");
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    hass_status_topic: String,
    events: mpsc::Sender<BrokerEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // The event loop is what drains the request queue, so never await here.
                if let Err(err) = client.try_subscribe(hass_status_topic.as_str(), QoS::AtLeastOnce) {
                    warn!(error = %err, "hass status subscribe failed");
                }
                let _ = events.try_send(BrokerEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == hass_status_topic && publish.payload.as_ref() == ONLINE.as_bytes() {
                    let _ = events.try_send(BrokerEvent::HassOnline);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt connection error");
                if events.is_closed() {
                    break;
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
