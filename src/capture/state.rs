use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::record::CaptureSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CapturePhase {
    #[default]
    Idle,
    Running,
    Stopping,
}

/// Handles owned by the controller for the one running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub handle: JoinHandle<()>,
    pub cancel: CancellationToken,
    /// Carries the new interval; every send re-anchors the worker.
    pub wake: watch::Sender<u64>,
}

/// Process-wide capture state. Only the controller mutates it, except
/// `sample_count`, which the worker bumps after each persisted record.
#[derive(Debug)]
pub struct CaptureState {
    pub phase: CapturePhase,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub interval_secs: u64,
    pub sample_count: u64,
    pub started_at: Option<String>,
    pub(crate) worker: Option<WorkerHandle>,
}

/// Read-only view handed to status callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub active: bool,
    pub phase: CapturePhase,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub interval_seconds: u64,
    pub sample_count: u64,
    pub started_at: Option<String>,
}

impl CaptureState {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            phase: CapturePhase::Idle,
            device_id: None,
            session_id: None,
            session_name: None,
            interval_secs,
            sample_count: 0,
            started_at: None,
            worker: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != CapturePhase::Idle
    }

    /// True when `session_id` belongs to the session being captured.
    pub fn is_capturing(&self, session_id: &str) -> bool {
        self.is_active() && self.session_id.as_deref() == Some(session_id)
    }

    pub fn snapshot(&self) -> CaptureStatus {
        CaptureStatus {
            active: self.is_active(),
            phase: self.phase,
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            interval_seconds: self.interval_secs,
            sample_count: self.sample_count,
            started_at: self.started_at.clone(),
        }
    }

    pub(crate) fn begin_session(
        &mut self,
        session: &CaptureSession,
        device_id: &str,
        interval_secs: u64,
        worker: WorkerHandle,
    ) {
        *self = Self {
            phase: CapturePhase::Running,
            device_id: Some(device_id.to_string()),
            session_id: Some(session.id.clone()),
            session_name: Some(session.name.clone()),
            interval_secs,
            sample_count: 0,
            started_at: Some(session.start_time.clone()),
            worker: Some(worker),
        };
    }

    /// Back to idle; the configured interval survives for the next session.
    pub fn finish(&mut self) {
        *self = Self::new(self.interval_secs);
    }
}
