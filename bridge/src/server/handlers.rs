//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::manager::ConnectionState;
use crate::connection::power::PowerState;
use crate::device::dispatcher::{Ack, Command};
use crate::device::machine::Lifecycle;
use crate::device::runtime::DeviceHandle;
use crate::errors::CommandError;
use crate::model::status::PrintStatus;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned on every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unknown_printer(id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("unknown printer {}", id))
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        let status = match &err {
            CommandError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CommandError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

async fn printer(state: &ServerState, id: &str) -> Result<Arc<DeviceHandle>, ApiError> {
    state
        .registry
        .get(id)
        .await
        .ok_or_else(|| ApiError::unknown_printer(id))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub printers: usize,
    pub uptime_secs: i64,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "crealink".to_string(),
        version: version_info().version,
        printers: state.registry.len().await,
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// One line per printer
#[derive(Debug, Serialize)]
pub struct PrinterSummary {
    pub id: String,
    pub host: String,
    pub model: Option<String>,
    pub lifecycle: Lifecycle,
    pub connection: ConnectionState,
    pub status: Option<PrintStatus>,
    pub available: bool,
}

/// Printers response
#[derive(Debug, Serialize)]
pub struct PrintersResponse {
    pub printers: Vec<PrinterSummary>,
    pub total: usize,
}

pub async fn printers_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut printers = Vec::new();
    for id in state.registry.ids().await {
        let Some(handle) = state.registry.get(&id).await else {
            continue;
        };
        let view = handle.view();
        printers.push(PrinterSummary {
            id,
            host: view.identity.host.clone(),
            model: view.model.clone(),
            lifecycle: view.lifecycle,
            connection: view.connection,
            status: view.status,
            available: view.telemetry.available,
        });
    }
    let total = printers.len();
    Json(PrintersResponse { printers, total })
}

/// Full state export of one printer
pub async fn printer_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = printer(&state, &id).await?;
    Ok(Json(handle.view().as_ref().clone()))
}

pub async fn diagnostics_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = printer(&state, &id).await?;
    Ok(Json(handle.diagnostics()))
}

pub async fn media_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = printer(&state, &id).await?;
    Ok(Json(handle.media()))
}

/// Command handler. The body is a tagged command, e.g. `{"command":"pause"}`.
pub async fn command_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(command): Json<Command>,
) -> Result<Json<Ack>, ApiError> {
    let handle = printer(&state, &id).await?;
    let name = command.name();
    match handle.send(command).await {
        Ok(ack) => {
            info!("{}: {} accepted in {}ms", id, name, ack.latency_ms);
            Ok(Json(ack))
        }
        Err(e) => {
            warn!("{}: {} failed: {}", id, name, e);
            Err(e.into())
        }
    }
}

/// Power request
#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub state: PowerState,
}

/// Power response
#[derive(Debug, Serialize)]
pub struct PowerResponse {
    pub id: String,
    pub state: PowerState,
}

pub async fn power_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<PowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = printer(&state, &id).await?;
    handle
        .set_power(request.state)
        .map_err(|e| ApiError::new(StatusCode::CONFLICT, e.to_string()))?;
    Ok(Json(PowerResponse {
        id,
        state: request.state,
    }))
}
