use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::{
    sync::{watch, Mutex},
    time,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::{paths, split_path, SharedStore};

use super::{
    error::{CaptureError, CaptureResult},
    record::{timestamp_label, CaptureSession},
    state::{CapturePhase, CaptureState, CaptureStatus, WorkerHandle},
    worker::{capture_loop, CaptureJob},
};

pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Upper bound for reading and classifying one sample. The record write
    /// itself is always awaited.
    pub cycle_timeout: Duration,
    /// How long Stop waits for the worker before aborting it.
    pub stop_timeout: Duration,
    /// Delay before the energy-reset command marker is cleared.
    pub command_cleanup_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(15),
            command_cleanup_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: String,
    pub session_name: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoppedSession {
    pub session_id: String,
    pub device_id: String,
    pub record_count: u64,
    pub end_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntervalUpdate {
    pub interval_seconds: u64,
}

/// Owns the capture lifecycle: at most one session, one worker.
#[derive(Clone)]
pub struct CaptureController {
    state: Arc<Mutex<CaptureState>>,
    // Serializes start/stop end to end; `state` is only held for reads and writes.
    lifecycle: Arc<Mutex<()>>,
    store: SharedStore,
    config: CaptureConfig,
}

impl CaptureController {
    pub fn new(store: SharedStore, interval_secs: u64, config: CaptureConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState::new(
                interval_secs.clamp(1, MAX_INTERVAL_SECS),
            ))),
            lifecycle: Arc::new(Mutex::new(())),
            store,
            config,
        }
    }

    pub async fn status(&self) -> CaptureStatus {
        self.state.lock().await.snapshot()
    }

    pub async fn start(
        &self,
        device_id: &str,
        session_name: &str,
        interval_secs: u64,
    ) -> CaptureResult<StartedSession> {
        let device_id = validate_key("device id", device_id)?;
        validate_interval(interval_secs)?;

        let _lifecycle = self.lifecycle.lock().await;
        if self.state.lock().await.is_active() {
            return Err(CaptureError::AlreadyActive);
        }

        let started = Local::now();
        let start_time = timestamp_label(started);
        let name = match session_name.trim() {
            "" => format!("Capture {start_time}"),
            name => name.to_string(),
        };
        let session = CaptureSession {
            id: Uuid::new_v4().to_string(),
            name,
            start_time,
            start_timestamp: started.timestamp_millis(),
            end_time: None,
            record_count: 0,
        };

        let meta = serde_json::to_value(&session).context("failed to encode session metadata")?;
        self.store
            .set(&paths::session_meta(device_id, &session.id), meta)
            .await
            .context("failed to write session metadata")?;

        self.spawn_energy_reset(device_id, &session.id);

        let cancel = CancellationToken::new();
        let (wake_tx, wake_rx) = watch::channel(interval_secs);
        let job = CaptureJob {
            device_id: device_id.to_string(),
            session_id: session.id.clone(),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            cycle_timeout: self.config.cycle_timeout,
        };

        {
            let mut state = self.state.lock().await;
            let handle = tokio::spawn(capture_loop(job, cancel.clone(), wake_rx));
            state.begin_session(
                &session,
                device_id,
                interval_secs,
                WorkerHandle {
                    handle,
                    cancel,
                    wake: wake_tx,
                },
            );
        }

        info!(
            "Capture session {} ('{}') started on device {} every {}s",
            session.id, session.name, device_id, interval_secs
        );

        Ok(StartedSession {
            session_id: session.id,
            session_name: session.name,
            device_id: device_id.to_string(),
        })
    }

    pub async fn stop(&self) -> CaptureResult<StoppedSession> {
        let _lifecycle = self.lifecycle.lock().await;

        let (worker, session_id, device_id) = {
            let mut state = self.state.lock().await;
            if state.phase != CapturePhase::Running {
                return Err(CaptureError::NotActive);
            }
            let (Some(session_id), Some(device_id)) =
                (state.session_id.clone(), state.device_id.clone())
            else {
                state.finish();
                return Err(CaptureError::NotActive);
            };
            state.phase = CapturePhase::Stopping;
            (state.worker.take(), session_id, device_id)
        };

        if let Some(worker) = worker {
            self.join_worker(worker, &session_id).await;
        }

        let record_count = self.state.lock().await.sample_count;
        let end_time = timestamp_label(Local::now());

        let mut fields = Map::new();
        fields.insert("endTime".into(), json!(end_time));
        fields.insert("recordCount".into(), json!(record_count));
        if let Err(err) = self
            .store
            .update(&paths::session_meta(&device_id, &session_id), fields)
            .await
        {
            error!("Failed to finalize capture session {session_id}: {err:#}");
        }

        self.state.lock().await.finish();
        info!("Capture session {session_id} stopped with {record_count} records");

        Ok(StoppedSession {
            session_id,
            device_id,
            record_count,
            end_time,
        })
    }

    /// Runs `op` while no capture can start or stop, unless `device_id` is
    /// being captured right now. With `session_id` set, only that session
    /// of the device is protected.
    pub(crate) async fn with_device_idle<T, F, Fut>(
        &self,
        device_id: &str,
        session_id: Option<&str>,
        op: F,
    ) -> CaptureResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CaptureResult<T>>,
    {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let state = self.state.lock().await;
            let protected = match session_id {
                Some(session_id) => state.is_capturing(session_id),
                None => state.is_active(),
            };
            if protected && state.device_id.as_deref() == Some(device_id) {
                return Err(CaptureError::AlreadyActive);
            }
        }
        op().await
    }

    /// Keeps the live status in step with a renamed archive entry.
    pub(crate) async fn rename_active(&self, session_id: &str, name: &str) {
        let mut state = self.state.lock().await;
        if state.is_capturing(session_id) {
            state.session_name = Some(name.to_string());
        }
    }

    /// Sets the interval for the running session (re-anchoring its cadence,
    /// even when the value is unchanged) and for sessions started later.
    pub async fn set_interval(&self, interval_secs: u64) -> CaptureResult<IntervalUpdate> {
        validate_interval(interval_secs)?;

        let mut state = self.state.lock().await;
        state.interval_secs = interval_secs;
        if state.phase == CapturePhase::Running {
            if let Some(worker) = &state.worker {
                if worker.wake.send(interval_secs).is_err() {
                    warn!("Capture worker already gone; interval change not delivered");
                }
            }
        }

        Ok(IntervalUpdate {
            interval_seconds: interval_secs,
        })
    }

    async fn join_worker(&self, worker: WorkerHandle, session_id: &str) {
        let WorkerHandle {
            mut handle,
            cancel,
            wake,
        } = worker;
        cancel.cancel();

        match time::timeout(self.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Capture worker for session {session_id} failed to join: {err}"),
            Err(_) => {
                warn!(
                    "Capture worker for session {session_id} did not stop within {}s; aborting",
                    self.config.stop_timeout.as_secs()
                );
                handle.abort();
                let _ = handle.await;
            }
        }
        drop(wake);
    }

    /// Asks the meter to zero its energy counters, then clears the command
    /// marker unless a later session has replaced it. Best effort: nothing
    /// waits on it and failures are only logged at debug level.
    fn spawn_energy_reset(&self, device_id: &str, session_id: &str) {
        let store = Arc::clone(&self.store);
        let path = paths::command(device_id);
        let cleanup_delay = self.config.command_cleanup_delay;
        let command = json!({
            "resetEnergy": true,
            "issuedAt": Utc::now().timestamp_millis(),
            "sessionId": session_id,
        });

        tokio::spawn(async move {
            if let Err(err) = store.set(&path, command.clone()).await {
                debug!("Energy reset command at {path} not delivered: {err:#}");
                return;
            }
            time::sleep(cleanup_delay).await;

            match store.get(&path).await {
                Ok(Some(current)) if current == command => {
                    if let Err(err) = store.remove(&path).await {
                        debug!("Energy reset marker at {path} not cleared: {err:#}");
                    }
                }
                Ok(_) => debug!("Energy reset marker at {path} was replaced; leaving it"),
                Err(err) => debug!("Energy reset marker at {path} not checked: {err:#}"),
            }
        });
    }
}

/// Trims `key` and checks it can name a single store path segment.
pub(crate) fn validate_key<'a>(what: &str, key: &'a str) -> CaptureResult<&'a str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(CaptureError::InvalidArgument(format!("{what} must not be empty")));
    }
    match split_path(key) {
        Ok(segments) if segments.len() == 1 && segments[0] == key => Ok(key),
        _ => Err(CaptureError::InvalidArgument(format!(
            "{what} '{key}' is not a valid key"
        ))),
    }
}

pub(crate) fn validate_interval(interval_secs: u64) -> CaptureResult<()> {
    if interval_secs == 0 || interval_secs > MAX_INTERVAL_SECS {
        return Err(CaptureError::InvalidArgument(format!(
            "interval must be between 1 and {MAX_INTERVAL_SECS} seconds"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{testing::ScriptedStore, DataStore, MemoryStore};
    use serde_json::Value;

    fn controller(store: &MemoryStore) -> CaptureController {
        CaptureController::new(Arc::new(store.clone()), 3, CaptureConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn start_writes_metadata_and_reports_running() {
        let store = MemoryStore::new();
        let capture = controller(&store);

        let started = capture.start("meter-1", "bench run", 2).await.unwrap();
        let status = capture.status().await;
        assert!(status.active);
        assert_eq!(status.phase, CapturePhase::Running);
        assert_eq!(status.session_id.as_deref(), Some(started.session_id.as_str()));
        assert_eq!(status.interval_seconds, 2);

        let meta = store
            .get(&paths::session_meta("meter-1", &started.session_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta["name"], "bench run");
        assert_eq!(meta["recordCount"], 0);
        assert!(meta.get("endTime").is_none());

        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_and_state_untouched() {
        let store = MemoryStore::new();
        let capture = controller(&store);
        let first = capture.start("meter-1", "first", 3).await.unwrap();

        let err = capture.start("meter-2", "second", 1).await.unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyActive));

        let status = capture.status().await;
        assert_eq!(status.session_id.as_deref(), Some(first.session_id.as_str()));
        assert_eq!(status.device_id.as_deref(), Some("meter-1"));
        assert_eq!(status.interval_seconds, 3);
        assert!(store.get(&paths::history("meter-2")).await.unwrap().is_none());

        capture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_idle_is_not_active_and_writes_nothing() {
        let store = MemoryStore::new();
        let capture = controller(&store);

        let err = capture.stop().await.unwrap_err();
        assert!(matches!(err, CaptureError::NotActive));
        assert_eq!(store.snapshot(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let store = MemoryStore::new();
        let capture = controller(&store);

        for (device, interval) in [("", 3), ("  ", 3), ("a/b", 3), ("meter-1", 0)] {
            let err = capture.start(device, "x", interval).await.unwrap_err();
            assert!(matches!(err, CaptureError::InvalidArgument(_)), "{device:?} {interval}");
        }
        assert!(matches!(
            capture.set_interval(0).await.unwrap_err(),
            CaptureError::InvalidArgument(_)
        ));
        assert!(!capture.status().await.active);
    }

    #[tokio::test]
    async fn set_interval_while_idle_updates_next_default() {
        let store = MemoryStore::new();
        let capture = controller(&store);
        let update = capture.set_interval(10).await.unwrap();
        assert_eq!(update.interval_seconds, 10);
        assert_eq!(capture.status().await.interval_seconds, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_finalizes_with_sample_count() {
        let store = MemoryStore::new();
        store
            .set(&paths::realtime("meter-1"), serde_json::json!({"V1": 230, "A1": 1, "P_SUM": 0.2}))
            .await
            .unwrap();
        let capture = controller(&store);
        let started = capture.start("meter-1", "count", 1).await.unwrap();

        // Samples at t = 0, 1, 2, 3.
        time::sleep(Duration::from_millis(3_500)).await;
        let stopped = capture.stop().await.unwrap();
        assert_eq!(stopped.record_count, 4);

        let session = store
            .get(&paths::session("meter-1", &started.session_id))
            .await
            .unwrap()
            .unwrap();
        let Value::Object(children) = session else {
            panic!("session is not an object");
        };
        assert_eq!(children.len(), 5);
        assert_eq!(children["_meta"]["recordCount"], 4);
        assert!(children["_meta"]["endTime"].is_string());

        let status = capture.status().await;
        assert!(!status.active);
        assert_eq!(status.interval_seconds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn energy_reset_marker_is_written_then_cleared() {
        let store = MemoryStore::new();
        let capture = controller(&store);
        capture.start("meter-1", "reset", 60).await.unwrap();

        time::sleep(Duration::from_millis(10)).await;
        let marker = store.get(&paths::command("meter-1")).await.unwrap();
        assert_eq!(marker.unwrap()["resetEnergy"], true);

        time::sleep(Duration::from_secs(6)).await;
        assert!(store.get(&paths::command("meter-1")).await.unwrap().is_none());

        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn later_session_keeps_its_reset_marker() {
        let store = MemoryStore::new();
        let capture = controller(&store);

        capture.start("meter-1", "first", 60).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        capture.stop().await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        let second = capture.start("meter-1", "second", 60).await.unwrap();

        // The first session's cleanup fires at t = 5s.
        time::sleep(Duration::from_millis(2_500)).await;
        let marker = store.get(&paths::command("meter-1")).await.unwrap().unwrap();
        assert_eq!(marker["sessionId"], second.session_id.as_str());

        // The second one's at t = 8s.
        time::sleep(Duration::from_secs(3)).await;
        assert!(store.get(&paths::command("meter-1")).await.unwrap().is_none());

        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_finalize_still_returns_to_idle() {
        let memory = MemoryStore::new();
        memory
            .set(&paths::realtime("meter-1"), serde_json::json!({"V1": 230, "A1": 1, "P_SUM": 0.2}))
            .await
            .unwrap();
        let store = ScriptedStore::new(memory.clone()).fail_updates(1);
        let capture = CaptureController::new(Arc::new(store), 3, CaptureConfig::default());
        let started = capture.start("meter-1", "flaky", 1).await.unwrap();

        time::sleep(Duration::from_millis(1_500)).await;
        let stopped = capture.stop().await.unwrap();
        assert_eq!(stopped.record_count, 2);
        assert!(!capture.status().await.active);

        let meta = memory
            .get(&paths::session_meta("meter-1", &started.session_id))
            .await
            .unwrap()
            .unwrap();
        assert!(meta.get("endTime").is_none());

        let again = capture.start("meter-1", "retry", 1).await.unwrap();
        assert_ne!(again.session_id, started.session_id);
        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_worker_is_aborted_and_session_finalized() {
        let memory = MemoryStore::new();
        let store = ScriptedStore::new(memory.clone()).delay_gets(&[Duration::from_secs(3_600)]);
        let config = CaptureConfig {
            cycle_timeout: Duration::from_secs(7_200),
            stop_timeout: Duration::from_secs(2),
            ..CaptureConfig::default()
        };
        let capture = CaptureController::new(Arc::new(store), 3, config);
        let started = capture.start("meter-1", "stuck", 1).await.unwrap();

        time::sleep(Duration::from_millis(100)).await;
        let stop_began = time::Instant::now();
        let stopped = capture.stop().await.unwrap();
        let waited = stop_began.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
        assert_eq!(stopped.record_count, 0);
        assert!(!capture.status().await.active);

        let meta = memory
            .get(&paths::session_meta("meter-1", &started.session_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta["recordCount"], 0);
        assert_eq!(meta["endTime"], stopped.end_time.as_str());
    }
}
