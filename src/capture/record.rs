use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::telemetry::{Liveness, MeterReading};

/// Human-readable timestamp layout shared by records and session metadata.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S %d/%m/%Y";

pub fn timestamp_label(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One archived sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: String,
    #[serde(default)]
    pub offline: bool,
    #[serde(flatten)]
    pub reading: MeterReading,
}

impl CaptureRecord {
    /// Offline records carry zeros, never the last values the device reported.
    pub fn new(timestamp: String, reading: Option<MeterReading>, liveness: Liveness) -> Self {
        let offline = liveness.is_offline();
        let reading = match reading {
            Some(reading) if !offline => reading,
            _ => MeterReading::ZERO,
        };
        Self {
            timestamp,
            offline,
            reading,
        }
    }
}

/// Session metadata stored under `History/<session>/_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: String,
    pub name: String,
    pub start_time: String,
    pub start_timestamp: i64,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub record_count: u64,
}

/// Stamps the records of one session. Labels never move backwards even if
/// the wall clock does, and keys (epoch milliseconds) are bumped past the
/// previous key so two samples never share a slot.
#[derive(Debug, Default)]
pub struct RecordClock {
    last_time: Option<DateTime<Local>>,
    last_key: Option<i64>,
}

/// When a record was captured and the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStamp {
    pub label: String,
    pub key: String,
}

impl RecordClock {
    pub fn stamp(&mut self, now: DateTime<Local>) -> RecordStamp {
        let at = match self.last_time {
            Some(previous) if now < previous => previous,
            _ => now,
        };
        self.last_time = Some(at);

        let millis = at.timestamp_millis();
        let key = match self.last_key {
            Some(previous) if millis <= previous => previous + 1,
            _ => millis,
        };
        self.last_key = Some(key);

        RecordStamp {
            label: timestamp_label(at),
            key: key.to_string(),
        }
    }
}
