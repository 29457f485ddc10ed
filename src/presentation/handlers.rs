// HTTP request handlers
use crate::application::errors::{IngestError, StorageError, TelemetryError};
use crate::domain::device::Device;
use crate::domain::power::{HourSummary, Resolution, Sample, Summary};
use crate::infrastructure::shelly_source::decode_rpc_event;
use crate::presentation::app_state::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct LatestQuery {
    pub resolution: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct SampleRequest {
    pub device_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub power_watts: f64,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "Storage error while serving request");
        ApiError::Unavailable(e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidReading { .. } => ApiError::BadRequest(e.to_string()),
            IngestError::Storage(inner) => inner.into(),
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Minute bucket used when a reading arrives without its own timestamp.
fn current_minute() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.report_service.list_devices().await?))
}

/// Most recent record for a device, `?resolution=minute|hour|day|week` (default hour)
pub async fn latest_summary(
    Path(device_id): Path<String>,
    Query(query): Query<LatestQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let resolution = match query.resolution.as_deref() {
        Some(raw) => raw.parse::<Resolution>().map_err(ApiError::BadRequest)?,
        None => Resolution::Hour,
    };

    let latest: Option<Summary> = state.report_service.latest(&device_id, resolution).await?;
    Ok(match latest {
        Some(summary) => Json(summary).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn hour_history(
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<HourSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(24);
    Ok(Json(
        state.report_service.hour_history(&device_id, limit).await?,
    ))
}

/// Accepts one reading from a telemetry collaborator
pub async fn ingest_sample(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SampleRequest>,
) -> Result<(StatusCode, Json<Sample>), ApiError> {
    let timestamp = request.timestamp.unwrap_or_else(current_minute);
    let sample = state
        .ingest_service
        .ingest(&request.device_id, timestamp, request.power_watts)
        .await?;
    Ok((StatusCode::CREATED, Json(sample)))
}

/// Accepts a Shelly `NotifyStatus` event forwarded from the plug or a broker bridge
pub async fn ingest_shelly_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let Some(reading) = decode_rpc_event(&body, state.mains_voltage)? else {
        return Ok(StatusCode::NO_CONTENT);
    };

    state
        .ingest_service
        .ingest(&reading.device_id, current_minute(), reading.power_watts)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
