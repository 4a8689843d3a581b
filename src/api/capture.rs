use axum::{extract::rejection::JsonRejection, extract::State, Json};
use log::warn;
use serde::Deserialize;
use serde_json::Number;

use crate::{
    capture::{CaptureError, CaptureStatus, IntervalUpdate, StartedSession, StoppedSession},
    settings::CaptureSettings,
};

use super::{ok, ApiResult, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub device_id: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub interval: Option<Number>,
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub interval: Number,
}

/// Whole seconds only; negatives and fractions are argument errors.
fn interval_secs(raw: &Number) -> Result<u64, CaptureError> {
    raw.as_u64().ok_or_else(|| {
        CaptureError::InvalidArgument(format!(
            "interval must be a positive whole number of seconds, got {raw}"
        ))
    })
}

pub async fn status(State(state): State<AppState>) -> ApiResult<CaptureStatus> {
    Ok(ok(state.capture.status().await))
}

pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<StartedSession> {
    let Json(request) = payload?;
    let interval = match &request.interval {
        Some(raw) => interval_secs(raw)?,
        None => state.capture.status().await.interval_seconds,
    };
    let started = state
        .capture
        .start(&request.device_id, &request.session_name, interval)
        .await?;
    Ok(ok(started))
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<StoppedSession> {
    Ok(ok(state.capture.stop().await?))
}

pub async fn set_interval(
    State(state): State<AppState>,
    payload: Result<Json<IntervalRequest>, JsonRejection>,
) -> ApiResult<IntervalUpdate> {
    let Json(request) = payload?;
    let update = state.capture.set_interval(interval_secs(&request.interval)?).await?;

    let persisted = CaptureSettings {
        interval_seconds: update.interval_seconds,
    };
    if let Err(err) = state.settings.update_capture(persisted) {
        warn!("Interval applied but not persisted: {err:#}");
    }
    Ok(ok(update))
}
