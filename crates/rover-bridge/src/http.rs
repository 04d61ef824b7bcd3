use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use entities::{unique_id, SensorKey, SensorState, SENSORS};
use poller_actor::PollState;
use types::DeviceInfo;

#[derive(Clone)]
pub struct AppState {
    pub poll_state: watch::Receiver<PollState>,
    pub device: Arc<DeviceInfo>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_poll_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SensorView {
    pub unique_id: String,
    pub key: SensorKey,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    /// None until the first successful poll.
    pub state: Option<SensorState>,
    pub available: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/sensors", get(sensors))
        .route("/device", get(device))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn health(State(app): State<AppState>) -> (StatusCode, Json<Health>) {
    let state = app.poll_state.borrow().clone();
    let code = if state.available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Health {
        status: if state.available { "ok" } else { "unavailable" },
        available: state.available,
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error,
        last_poll_ms: state.reading.map(|reading| reading.collected_at_ms),
    };
    (code, Json(body))
}

pub async fn sensors(State(app): State<AppState>) -> Json<Vec<SensorView>> {
    let state = app.poll_state.borrow().clone();
    let views = SENSORS
        .iter()
        .map(|sensor| SensorView {
            unique_id: unique_id(&app.device.serial_number, sensor.key),
            key: sensor.key,
            name: sensor.name,
            unit: sensor.unit,
            state: state.reading.as_ref().map(|reading| sensor.state(reading)),
            available: state.available,
        })
        .collect();
    Json(views)
}

pub async fn device(State(app): State<AppState>) -> Json<DeviceInfo> {
    Json(app.device.as_ref().clone())
}

pub async fn metrics(State(app): State<AppState>) -> Response {
    match app.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

pub async fn serve(bind: &str, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid http bind address {bind}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind http listener {addr}"))?;
    info!(%addr, "status server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("status server failed")
}
