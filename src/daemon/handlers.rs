//! HTTP surface of the daemon: the receiving end of the notification channel
//! plus container lifecycle calls.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::container::{Container, RunState};
use crate::error::Error;
use crate::status::{StartStatus, StopStatus};

use super::{CreateOptions, Daemon};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps daemon errors onto HTTP statuses. Duplicate deliveries come back as
/// 409 so the notifier stops retrying them.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyStarted
            | Error::AlreadyStopped
            | Error::Paused
            | Error::AlreadyExists(_)
            | Error::Ip(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {}", self.0);
        } else {
            log::debug!("request rejected: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/_ping", get(|| async { "OK" }))
        .route("/monitor/{id}/start", post(monitor_start))
        .route("/monitor/{id}/stop", post(monitor_stop))
        .route("/containers/json", get(list_containers))
        .route("/containers/create", post(create_container))
        .route("/containers/{id}/start", post(start_container))
        .route("/containers/{id}/stop", post(stop_container))
        .with_state(daemon)
}

/// Serve notifications on `listener` until `shutdown` resolves.
pub async fn serve(
    daemon: Arc<Daemon>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("notification server listening on {addr}");
    }
    axum::serve(listener, router(daemon))
        .with_graceful_shutdown(shutdown)
        .await
        .context("notification server failed")
}

async fn monitor_start(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(status): Json<StartStatus>,
) -> Result<StatusCode, ApiError> {
    daemon.container_monitor_start(&id, status)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn monitor_stop(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(status): Json<StopStatus>,
) -> Result<StatusCode, ApiError> {
    daemon.container_monitor_stop(&id, status)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: Option<String>,
    pub status: RunState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub ip_address: Option<IpAddr>,
    pub error: Option<String>,
}

impl From<&Container> for ContainerSummary {
    fn from(container: &Container) -> Self {
        Self {
            id: container.id().to_string(),
            name: container.config.name.clone(),
            status: container.state.status,
            pid: container.state.pid,
            exit_code: container.state.exit_code,
            restart_count: container.state.restart_count,
            ip_address: container.network.ip_address,
            error: container.state.error.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Created {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    /// How long to wait for the workload to come up; 0 returns immediately.
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {
    signal: Option<String>,
}

async fn list_containers(State(daemon): State<Arc<Daemon>>) -> Json<Vec<ContainerSummary>> {
    Json(daemon.list().iter().map(ContainerSummary::from).collect())
}

async fn create_container(
    State(daemon): State<Arc<Daemon>>,
    Json(options): Json<CreateOptions>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let id = daemon.create_container(options)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn start_container(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Query(params): Query<StartParams>,
) -> Result<StatusCode, ApiError> {
    daemon.start_container(&id)?;
    let timeout = params
        .timeout_ms
        .map_or(DEFAULT_START_TIMEOUT, Duration::from_millis);
    if !timeout.is_zero() {
        daemon.wait_started(&id, Some(timeout)).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_container(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<StatusCode, Response> {
    let signal = match params.signal.as_deref() {
        None => Signal::SIGTERM,
        Some(name) => name.parse::<Signal>().map_err(|_| {
            (StatusCode::BAD_REQUEST, format!("unknown signal {name:?}")).into_response()
        })?,
    };
    daemon
        .stop_container(&id, signal)
        .map_err(|e| ApiError(e).into_response())?;
    Ok(StatusCode::NO_CONTENT)
}
