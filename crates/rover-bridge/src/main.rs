use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use discovery::{candidate_addresses, identify, scan_serial_ports, verify_serial};
use entities::SENSORS;
use hass_mqtt::{Publisher, Topics};
use modbus_client::{ClientConfig, ModbusClient};
use poller_actor::{state_channel, ActorConfig, PollerActor, PollerError, StateSender};
use rover_bridge::http::{self, AppState};
use rover_bridge::BridgeConfig;
use types::DeviceIdentity;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_config_arg();
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let metrics = install_metrics();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let port = if config.device.is_auto_port() {
        let ports = scan_serial_ports(&config.discovery).context("serial port scan failed")?;
        info!(port = %ports.default_port, candidates = ports.ports.len(), "using detected serial port");
        ports.default_port
    } else {
        config.device.port.clone()
    };
    let client_config = config.client_config(&port);

    let client = Arc::new(
        ModbusClient::connect(client_config.clone())
            .await
            .with_context(|| format!("open {}", client_config.transport))?,
    );
    let addresses = candidate_addresses(config.device.unit_id, &config.discovery);
    let device = identify(client.as_ref(), &addresses)
        .await
        .context("controller identification failed")?;
    verify_serial(config.device.serial_number.as_deref(), &device)
        .context("controller does not match configuration")?;

    let identity = DeviceIdentity {
        endpoint: client_config.transport.endpoint(),
        unit_id: device.unit_id,
    };
    let (state_tx, state_rx) = state_channel();

    let topics = match &config.mqtt {
        Some(mqtt) => Topics::new(&mqtt.discovery_prefix, &mqtt.base_topic, &device.serial_number),
        None => {
            let defaults = hass_mqtt::MqttConfig::default();
            Topics::new(&defaults.discovery_prefix, &defaults.base_topic, &device.serial_number)
        }
    };
    let (publisher, events, mqtt_handle) = match &config.mqtt {
        Some(mqtt) => {
            let (publisher, events, handle) = Publisher::connect(mqtt, topics, SENSORS);
            (publisher, events, Some(handle))
        }
        None => {
            info!("mqtt not configured, publishing to log only");
            let (_events_tx, events_rx) = mpsc::channel(1);
            (Publisher::new_mock(topics, SENSORS), events_rx, None)
        }
    };
    let publisher_handle = tokio::spawn(publisher.run(
        device.clone(),
        state_rx.clone(),
        events,
        shutdown_rx.clone(),
    ));

    let http_handle = config.http_bind.clone().map(|bind| {
        let app = AppState {
            poll_state: state_rx.clone(),
            device: Arc::new(device.clone()),
            metrics: metrics.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = http::serve(&bind, app, shutdown).await {
                warn!(error = %err, "status server exited");
            }
        })
    });

    let setup = PollerSetup {
        identity,
        client_config,
        poller_config: config.poller.clone(),
        state: state_tx,
        shutdown: shutdown_rx.clone(),
    };

    let respawn_delay = Duration::from_millis(config.respawn_delay_ms);
    let mut join_set = JoinSet::new();
    spawn_poller(setup.clone(), Some(client), &mut join_set, Duration::ZERO);

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
            maybe_result = join_set.join_next() => {
                match maybe_result {
                    Some(Ok(Ok(()))) => {
                        info!(device = %setup.identity, "poller exited cleanly");
                        break;
                    }
                    Some(Ok(Err(err))) => {
                        warn!(device = %setup.identity, error = %err, "poller exited with error");
                        counter!("rover_bridge_poller_respawns_total").increment(1);
                        spawn_poller(setup.clone(), None, &mut join_set, respawn_delay);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "poller task failed");
                        counter!("rover_bridge_poller_respawns_total").increment(1);
                        spawn_poller(setup.clone(), None, &mut join_set, respawn_delay);
                    }
                    None => break,
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            warn!(error = %err, "poller task join failed");
        }
    }

    let _ = publisher_handle.await;
    if let Some(handle) = mqtt_handle {
        // Give the event loop a moment to flush the offline message.
        sleep(Duration::from_millis(200)).await;
        handle.abort();
    }
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

#[derive(Clone)]
struct PollerSetup {
    identity: DeviceIdentity,
    client_config: ClientConfig,
    poller_config: ActorConfig,
    state: StateSender,
    shutdown: watch::Receiver<bool>,
}

/// Runs a poller on `client`, or on a freshly opened connection when respawning.
fn spawn_poller(
    setup: PollerSetup,
    client: Option<Arc<ModbusClient>>,
    join_set: &mut JoinSet<Result<(), PollerError>>,
    delay: Duration,
) {
    join_set.spawn(async move {
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
        let client = match client {
            Some(client) => client,
            None => {
                let client = ModbusClient::connect(setup.client_config.clone()).await?;
                info!(device = %setup.identity, "modbus connection reopened");
                Arc::new(client)
            }
        };
        let actor = PollerActor::new(
            setup.identity,
            client,
            setup.state,
            setup.shutdown,
            setup.poller_config,
        );
        actor.run().await
    });
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "prometheus recorder install failed");
            None
        }
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
