//! Archive of finished and in-progress capture sessions.

use std::cmp::Ordering;

use anyhow::Context;
use chrono::Local;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    capture::{
        controller::validate_key, record::timestamp_label, CaptureController, CaptureError,
        CaptureRecord, CaptureResult, CaptureSession,
    },
    store::{paths, SharedStore},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRecord {
    pub key: String,
    #[serde(flatten)]
    pub record: CaptureRecord,
}

/// Means of the instantaneous fields over online records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstantAverages {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub frequency: f64,
    pub apparent: f64,
    pub reactive: f64,
    pub power_factor: f64,
    pub phase1: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnergyTotals {
    pub energy: f64,
    pub energy_apparent: f64,
    pub energy_reactive: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub total_records: u64,
    pub online_records: u64,
    pub offline_records: u64,
    pub averages: InstantAverages,
    pub energy: EnergyTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: CaptureSession,
    pub records: Vec<KeyedRecord>,
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredSession {
    pub device_id: String,
    pub session_id: String,
    pub record_count: u64,
}

pub fn summarize<'a, I>(records: I) -> SessionSummary
where
    I: IntoIterator<Item = &'a CaptureRecord>,
{
    let mut summary = SessionSummary::default();
    let mut sums = InstantAverages::default();

    for record in records {
        summary.total_records += 1;
        if record.offline {
            summary.offline_records += 1;
            continue;
        }
        summary.online_records += 1;

        let r = &record.reading;
        sums.voltage += r.voltage;
        sums.current += r.current;
        sums.power += r.power;
        sums.frequency += r.frequency;
        sums.apparent += r.apparent;
        sums.reactive += r.reactive;
        sums.power_factor += r.power_factor;
        sums.phase1 += r.phase1;

        summary.energy.energy += r.energy;
        summary.energy.energy_apparent += r.energy_apparent;
        summary.energy.energy_reactive += r.energy_reactive;
    }

    if summary.online_records > 0 {
        let n = summary.online_records as f64;
        summary.averages = InstantAverages {
            voltage: sums.voltage / n,
            current: sums.current / n,
            power: sums.power / n,
            frequency: sums.frequency / n,
            apparent: sums.apparent / n,
            reactive: sums.reactive / n,
            power_factor: sums.power_factor / n,
            phase1: sums.phase1 / n,
        };
    }
    summary
}

/// Session management over the store. Destructive operations refuse to
/// touch the session currently being captured.
#[derive(Clone)]
pub struct SessionArchive {
    store: SharedStore,
    capture: CaptureController,
}

impl SessionArchive {
    pub fn new(store: SharedStore, capture: CaptureController) -> Self {
        Self { store, capture }
    }

    /// Newest first.
    pub async fn list_sessions(&self, device_id: &str) -> CaptureResult<Vec<CaptureSession>> {
        let device_id = validate_key("device id", device_id)?;
        let history = self
            .store
            .get(&paths::history(device_id))
            .await
            .context("failed to read session history")?;

        let mut sessions: Vec<CaptureSession> = into_object(history)
            .into_iter()
            .filter_map(|(session_id, node)| {
                let meta = node.get(paths::META_KEY)?.clone();
                match serde_json::from_value(meta) {
                    Ok(session) => Some(session),
                    Err(err) => {
                        warn!("Skipping session {session_id} with unreadable metadata: {err}");
                        None
                    }
                }
            })
            .collect();

        sessions.sort_by(|a, b| b.start_timestamp.cmp(&a.start_timestamp));
        Ok(sessions)
    }

    pub async fn session_records(
        &self,
        device_id: &str,
        session_id: &str,
    ) -> CaptureResult<Vec<KeyedRecord>> {
        let (_, records) = self.load_session(device_id, session_id).await?;
        Ok(records)
    }

    pub async fn session_detail(
        &self,
        device_id: &str,
        session_id: &str,
    ) -> CaptureResult<SessionDetail> {
        let (session, records) = self.load_session(device_id, session_id).await?;
        let summary = summarize(records.iter().map(|keyed| &keyed.record));
        Ok(SessionDetail {
            session,
            records,
            summary,
        })
    }

    pub async fn rename_session(
        &self,
        device_id: &str,
        session_id: &str,
        name: &str,
    ) -> CaptureResult<CaptureSession> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CaptureError::InvalidArgument("session name must not be empty".into()));
        }

        let (device_id, session_id) = validate_ids(device_id, session_id)?;
        let mut session = self.load_meta(device_id, session_id).await?;
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        self.store
            .update(&paths::session_meta(device_id, session_id), fields)
            .await
            .context("failed to rename session")?;
        self.capture.rename_active(session_id, name).await;

        session.name = name.to_string();
        Ok(session)
    }

    pub async fn delete_session(&self, device_id: &str, session_id: &str) -> CaptureResult<()> {
        let (device_id, session_id) = validate_ids(device_id, session_id)?;
        let path = paths::session(device_id, session_id);

        self.capture
            .with_device_idle(device_id, Some(session_id), || async {
                let exists = self
                    .store
                    .get(&path)
                    .await
                    .context("failed to read session")?
                    .is_some();
                if !exists {
                    return Err(CaptureError::SessionNotFound(session_id.to_string()));
                }
                self.store.remove(&path).await.context("failed to delete session")?;
                Ok(())
            })
            .await?;

        info!("Deleted session {session_id} of device {device_id}");
        Ok(())
    }

    /// Removes every session of the device. Returns how many were removed.
    pub async fn clear_history(&self, device_id: &str) -> CaptureResult<usize> {
        let device_id = validate_key("device id", device_id)?;
        let path = paths::history(device_id);

        let removed = self
            .capture
            .with_device_idle(device_id, None, || async {
                let history = self
                    .store
                    .get(&path)
                    .await
                    .context("failed to read session history")?;
                self.store
                    .remove(&path)
                    .await
                    .context("failed to clear session history")?;
                Ok::<_, CaptureError>(into_object(history).len())
            })
            .await?;

        info!("Cleared {removed} session(s) of device {device_id}");
        Ok(removed)
    }

    /// Finalizes sessions left without an end time by a process that died
    /// mid-capture. The session being captured right now is left alone.
    pub async fn recover_unfinished(&self) -> CaptureResult<Vec<RecoveredSession>> {
        let devices = self
            .store
            .get(paths::DEVICES)
            .await
            .context("failed to read devices")?;

        let mut recovered = Vec::new();
        for (device_id, device) in into_object(devices) {
            let Some(Value::Object(history)) = device.get("History") else {
                continue;
            };
            for (session_id, session) in history {
                let Some(Value::Object(meta)) = session.get(paths::META_KEY) else {
                    continue;
                };
                if meta.get("endTime").is_some_and(|end| !end.is_null()) {
                    continue;
                }

                let record_count = session
                    .as_object()
                    .map(|children| children.keys().filter(|k| *k != paths::META_KEY).count())
                    .unwrap_or(0) as u64;
                let mut fields = Map::new();
                fields.insert("endTime".into(), json!(timestamp_label(Local::now())));
                fields.insert("recordCount".into(), json!(record_count));

                let finalized = self
                    .capture
                    .with_device_idle(&device_id, Some(session_id.as_str()), || async {
                        self.store
                            .update(&paths::session_meta(&device_id, session_id), fields)
                            .await
                            .with_context(|| format!("failed to finalize session {session_id}"))?;
                        Ok::<_, CaptureError>(())
                    })
                    .await;
                match finalized {
                    Ok(()) => {}
                    Err(CaptureError::AlreadyActive) => continue,
                    Err(err) => return Err(err),
                }

                warn!("Recovered unfinished session {session_id} of device {device_id} ({record_count} records)");
                recovered.push(RecoveredSession {
                    device_id: device_id.clone(),
                    session_id: session_id.clone(),
                    record_count,
                });
            }
        }
        Ok(recovered)
    }

    async fn load_meta(&self, device_id: &str, session_id: &str) -> CaptureResult<CaptureSession> {
        let meta = self
            .store
            .get(&paths::session_meta(device_id, session_id))
            .await
            .context("failed to read session metadata")?
            .ok_or_else(|| CaptureError::SessionNotFound(session_id.to_string()))?;
        let session = serde_json::from_value(meta)
            .with_context(|| format!("session {session_id} has unreadable metadata"))?;
        Ok(session)
    }

    async fn load_session(
        &self,
        device_id: &str,
        session_id: &str,
    ) -> CaptureResult<(CaptureSession, Vec<KeyedRecord>)> {
        let (device_id, session_id) = validate_ids(device_id, session_id)?;
        let node = self
            .store
            .get(&paths::session(device_id, session_id))
            .await
            .context("failed to read session")?;
        let mut children = into_object(node);

        let meta = children
            .remove(paths::META_KEY)
            .ok_or_else(|| CaptureError::SessionNotFound(session_id.to_string()))?;
        let session: CaptureSession = serde_json::from_value(meta)
            .with_context(|| format!("session {session_id} has unreadable metadata"))?;

        let mut records: Vec<KeyedRecord> = children
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(record) => Some(KeyedRecord { key, record }),
                Err(err) => {
                    warn!("Skipping unreadable record {key} in session {session_id}: {err}");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| compare_keys(&a.key, &b.key));

        Ok((session, records))
    }
}

fn validate_ids<'a>(device_id: &'a str, session_id: &'a str) -> CaptureResult<(&'a str, &'a str)> {
    Ok((
        validate_key("device id", device_id)?,
        validate_key("session id", session_id)?,
    ))
}

fn into_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Record keys are epoch milliseconds; compare numerically when both parse.
fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
