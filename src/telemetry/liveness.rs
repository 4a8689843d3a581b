//! Device liveness inferred from the payload itself.
//!
//! The meter has no heartbeat, so a device counts as offline when its payload
//! is missing, reads zero activity, or has not changed for longer than about
//! two sampling periods.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::MeterReading;

const MIN_STALE_THRESHOLD: Duration = Duration::from_secs(6);

/// How long an unchanged payload is tolerated before the device is offline.
pub fn stale_threshold(interval: Duration) -> Duration {
    interval.saturating_mul(2).max(MIN_STALE_THRESHOLD)
}

/// Content identity of a raw payload, independent of key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    Empty,
    Digest([u8; 32]),
}

impl Fingerprint {
    pub fn of(raw: Option<&Value>) -> Self {
        match raw {
            None | Some(Value::Null) => Fingerprint::Empty,
            Some(value) => {
                let mut hasher = Sha256::new();
                feed(&mut hasher, value);
                Fingerprint::Digest(hasher.finalize().into())
            }
        }
    }
}

// Each variant is tagged so that e.g. the string "1" and the number 1 differ.
fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(flag) => hasher.update(if *flag { b"t" } else { b"f" }),
        Value::Number(number) => {
            hasher.update(b"#");
            hasher.update(number.to_string().as_bytes());
            hasher.update(b";");
        }
        Value::String(text) => {
            hasher.update(b"s");
            hasher.update((text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update(b"{");
            for (key, child) in entries {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                feed(hasher, child);
            }
            hasher.update(b"}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    NoData,
    ZeroActivity,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline(OfflineReason),
}

impl Liveness {
    pub fn is_offline(&self) -> bool {
        matches!(self, Liveness::Offline(_))
    }
}

/// Tracks when the raw payload last changed. One detector per capture session.
#[derive(Debug, Default)]
pub struct LivenessDetector {
    last_change: Option<(Fingerprint, Instant)>,
}

impl LivenessDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time since the payload last changed; `None` if no payload was ever seen.
    pub fn stale_for(&self, now: Instant) -> Option<Duration> {
        self.last_change
            .map(|(_, changed_at)| now.saturating_duration_since(changed_at))
    }

    /// Records this tick's payload and classifies the device.
    pub fn observe(
        &mut self,
        raw: Option<&Value>,
        reading: Option<&MeterReading>,
        interval: Duration,
        now: Instant,
    ) -> Liveness {
        let fingerprint = Fingerprint::of(raw);
        let changed = match self.last_change {
            Some((previous, _)) => previous != fingerprint,
            None => true,
        };
        if changed {
            self.last_change = Some((fingerprint, now));
        }

        let Some(reading) = reading else {
            return Liveness::Offline(OfflineReason::NoData);
        };
        if reading.is_zero_activity() {
            return Liveness::Offline(OfflineReason::ZeroActivity);
        }
        let stale = self
            .stale_for(now)
            .map_or(true, |stale_for| stale_for > stale_threshold(interval));
        if stale {
            return Liveness::Offline(OfflineReason::Stale);
        }
        Liveness::Online
    }
}
