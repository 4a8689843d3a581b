pub mod liveness;
pub mod normalize;

pub use liveness::{stale_threshold, Liveness, LivenessDetector, OfflineReason};
pub use normalize::{normalize, MeterReading};
