use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use modbus_client::RegisterReader;
use rover_registers::read_reading;
use types::{ControllerReading, DeviceIdentity};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub poll_interval: Duration,
    pub jitter_ms: u64,
    /// Consecutive failed polls before sensors are reported unavailable.
    pub unavailable_after_failures: u32,
    /// Consecutive failed polls before the actor gives up so the link can be reopened.
    pub reconnect_after_failures: Option<u32>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter_ms: 0,
            unavailable_after_failures: 3,
            reconnect_after_failures: Some(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to connect to modbus device: {0}")]
    Connect(#[from] modbus_client::ClientError),
    #[error("{failures} consecutive polls failed, last error: {last_error}")]
    Stalled { failures: u32, last_error: String },
}

/// What sensors see: the last good reading plus link health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollState {
    pub reading: Option<ControllerReading>,
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            reading: None,
            available: false,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

impl PollState {
    pub fn record_success(&mut self, reading: ControllerReading) {
        self.reading = Some(reading);
        self.available = true;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    /// Keeps the previous reading; availability drops once `threshold` failures in a row are reached.
    pub fn record_failure(&mut self, error: impl Into<String>, threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        if self.consecutive_failures >= threshold.max(1) {
            self.available = false;
        }
    }
}

pub type StateSender = Arc<watch::Sender<PollState>>;

pub fn state_channel() -> (StateSender, watch::Receiver<PollState>) {
    let (tx, rx) = watch::channel(PollState::default());
    (Arc::new(tx), rx)
}

/// A polling task responsible for one controller.
pub struct PollerActor<R: ?Sized> {
    identity: DeviceIdentity,
    reader: Arc<R>,
    state: StateSender,
    shutdown: watch::Receiver<bool>,
    config: ActorConfig,
}

impl<R> PollerActor<R>
where
    R: RegisterReader + ?Sized,
{
    pub fn new(
        identity: DeviceIdentity,
        reader: Arc<R>,
        state: StateSender,
        shutdown: watch::Receiver<bool>,
        config: ActorConfig,
    ) -> Self {
        Self {
            identity,
            reader,
            state,
            shutdown,
            config,
        }
    }

    /// One read-decode-publish cycle. Returns true when the controller answered.
    pub async fn poll_once(&self) -> bool {
        let started = Instant::now();
        let outcome = read_reading(self.reader.as_ref(), self.identity.unit_id, unix_ms()).await;
        histogram!("rover_poll_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(reading) => {
                debug!(
                    device = %self.identity,
                    solar_power = reading.solar_power,
                    battery_voltage = reading.battery_voltage,
                    charging_status = %reading.charging_status,
                    "poll ok"
                );
                counter!("rover_polls_total", "outcome" => "ok").increment(1);
                self.state.send_modify(|state| state.record_success(reading));
                gauge!("rover_consecutive_failures").set(0.0);
                true
            }
            Err(err) => {
                counter!("rover_polls_total", "outcome" => "error").increment(1);
                let threshold = self.config.unavailable_after_failures;
                let mut became_unavailable = false;
                self.state.send_modify(|state| {
                    let was_available = state.available;
                    state.record_failure(err.to_string(), threshold);
                    became_unavailable = was_available && !state.available;
                });
                let failures = self.state.borrow().consecutive_failures;
                gauge!("rover_consecutive_failures").set(f64::from(failures));
                warn!(device = %self.identity, error = %err, failures, "poll failed");
                if became_unavailable {
                    warn!(device = %self.identity, failures, "controller marked unavailable");
                }
                false
            }
        }
    }

    pub async fn run(mut self) -> Result<(), PollerError> {
        let mut iteration = 0u64;

        loop {
            if *self.shutdown.borrow() {
                info!(device = %self.identity, "poller shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            self.poll_once().await;

            if let Some(limit) = self.config.reconnect_after_failures {
                let state = self.state.borrow().clone();
                if state.consecutive_failures >= limit.max(1) {
                    return Err(PollerError::Stalled {
                        failures: state.consecutive_failures,
                        last_error: state.last_error.unwrap_or_default(),
                    });
                }
            }

            iteration = iteration.wrapping_add(1);
            let elapsed = cycle_start.elapsed();
            let lag = elapsed.saturating_sub(self.config.poll_interval);
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration);
            debug!(
                device = %self.identity,
                elapsed_ms = elapsed.as_millis(),
                lag_ms = lag.as_millis(),
                delay_ms = delay.as_millis(),
                "poll cycle complete"
            );

            tokio::select! {
                _ = sleep(delay) => {},
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!(device = %self.identity, "poller shutdown requested");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let jitter_window = jitter_ms.max(1);
    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    let offset = seed % jitter_window;
    base + Duration::from_millis(offset)
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
