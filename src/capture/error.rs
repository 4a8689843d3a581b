use thiserror::Error;

/// Errors surfaced synchronously to callers of capture and archive operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture session is already active")]
    AlreadyActive,
    #[error("no capture session is active")]
    NotActive,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
