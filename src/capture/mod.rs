//! Capture lifecycle: one session at a time, sampled by a background worker
//! on a drift-corrected cadence.

pub mod controller;
pub mod error;
pub mod record;
pub mod schedule;
pub mod state;
pub mod worker;

pub use controller::{
    CaptureConfig, CaptureController, IntervalUpdate, StartedSession, StoppedSession,
    MAX_INTERVAL_SECS,
};
pub use error::{CaptureError, CaptureResult};
pub use record::{CaptureRecord, CaptureSession};
pub use state::{CapturePhase, CaptureStatus};
