use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{capture::CaptureSession, history::SessionDetail};

use super::{ok, ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct SessionList {
    sessions: Vec<CaptureSession>,
}

#[derive(Debug, Serialize)]
pub struct Renamed {
    session: CaptureSession,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    deleted: String,
}

#[derive(Debug, Serialize)]
pub struct Cleared {
    removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub name: String,
}

pub async fn list(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<SessionList> {
    let sessions = state.archive.list_sessions(&device_id).await?;
    Ok(ok(SessionList { sessions }))
}

pub async fn detail(
    State(state): State<AppState>,
    Path((device_id, session_id)): Path<(String, String)>,
) -> ApiResult<SessionDetail> {
    Ok(ok(state.archive.session_detail(&device_id, &session_id).await?))
}

pub async fn rename(
    State(state): State<AppState>,
    Path((device_id, session_id)): Path<(String, String)>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> ApiResult<Renamed> {
    let Json(request) = payload?;
    let session = state
        .archive
        .rename_session(&device_id, &session_id, &request.name)
        .await?;
    Ok(ok(Renamed { session }))
}

pub async fn remove(
    State(state): State<AppState>,
    Path((device_id, session_id)): Path<(String, String)>,
) -> ApiResult<Deleted> {
    state.archive.delete_session(&device_id, &session_id).await?;
    Ok(ok(Deleted { deleted: session_id }))
}

pub async fn clear(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Cleared> {
    let removed = state.archive.clear_history(&device_id).await?;
    Ok(ok(Cleared { removed }))
}
