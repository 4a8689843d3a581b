//! HTTP control surface over the capture controller and session archive.

mod capture;
mod sessions;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use crate::{
    capture::{CaptureController, CaptureError},
    history::SessionArchive,
    settings::SettingsStore,
};

#[derive(Clone)]
pub struct AppState {
    pub capture: CaptureController,
    pub archive: SessionArchive,
    pub settings: Arc<SettingsStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/capture/status", get(capture::status))
        .route("/api/capture/start", post(capture::start))
        .route("/api/capture/stop", post(capture::stop))
        .route("/api/capture/interval", post(capture::set_interval))
        .route("/api/devices/:device_id/sessions", get(sessions::list))
        .route(
            "/api/devices/:device_id/sessions/:session_id",
            get(sessions::detail).delete(sessions::remove),
        )
        .route(
            "/api/devices/:device_id/sessions/:session_id/rename",
            post(sessions::rename),
        )
        .route("/api/devices/:device_id/history", delete(sessions::clear))
        .with_state(state)
}

/// `{"ok": true, ...body}` success envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

pub fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { ok: true, body })
}

#[derive(Debug)]
pub enum ApiError {
    Capture(CaptureError),
    BadRequest(String),
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        Self::Capture(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Capture(err) => {
                let status = match &err {
                    CaptureError::AlreadyActive | CaptureError::NotActive => StatusCode::CONFLICT,
                    CaptureError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                    CaptureError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    CaptureError::Store(inner) => {
                        error!("Store request failed: {inner:#}");
                        StatusCode::BAD_GATEWAY
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Running HTTP server. Dropping the handle leaves it serving.
pub struct ApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ApiHandle {
    pub async fn spawn(bind: SocketAddr, state: AppState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let address = listener.local_addr()?;
        info!("HTTP API listening on {address}");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!("HTTP API exited with error: {err}");
            }
        });

        Ok(Self {
            address,
            task,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(anyhow::Error::from)
    }
}
