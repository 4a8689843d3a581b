use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, error, info, warn};
use tokio::{
    sync::{watch, Mutex},
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    store::{paths, SharedStore},
    telemetry::{normalize, Liveness, LivenessDetector, MeterReading, OfflineReason},
};

use super::{
    record::{CaptureRecord, RecordClock},
    schedule::CaptureSchedule,
    state::CaptureState,
};

/// Everything one worker needs for the lifetime of its session.
pub struct CaptureJob {
    pub device_id: String,
    pub session_id: String,
    pub store: SharedStore,
    pub state: Arc<Mutex<CaptureState>>,
    /// Upper bound for reading and classifying one sample.
    pub cycle_timeout: Duration,
}

enum WaitOutcome {
    Cancelled,
    IntervalChanged,
    ControllerGone,
    Elapsed,
}

/// Samples the device on a drift-corrected cadence until `cancel` fires.
///
/// `wake` carries the interval in seconds. A new value re-anchors the cadence
/// without taking a sample; a failed cycle is logged and skipped.
///
/// Per-tick output goes through `log` under this module's path, so
/// `RUST_LOG=wattlog_lib::capture::worker=warn` quiets it.
pub async fn capture_loop(
    job: CaptureJob,
    cancel: CancellationToken,
    mut wake: watch::Receiver<u64>,
) {
    let interval = Duration::from_secs(*wake.borrow_and_update());
    let mut schedule = CaptureSchedule::starting_at(Instant::now(), interval);
    let mut liveness = LivenessDetector::new();
    let mut clock = RecordClock::default();

    info!(
        "capture loop started for session {} (device {}, every {}s)",
        job.session_id,
        job.device_id,
        interval.as_secs()
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // A change raised while the previous cycle was running.
        match wake.has_changed() {
            Ok(true) => {
                reanchor(&mut schedule, &mut wake, &job.session_id);
                continue;
            }
            Ok(false) => {}
            Err(_) => {
                warn!("capture controller dropped; session {} worker exiting", job.session_id);
                break;
            }
        }

        let now = Instant::now();
        if !schedule.is_due(now) {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => WaitOutcome::Cancelled,
                changed = wake.changed() => match changed {
                    Ok(()) => WaitOutcome::IntervalChanged,
                    Err(_) => WaitOutcome::ControllerGone,
                },
                _ = time::sleep(schedule.wait_slice(now)) => WaitOutcome::Elapsed,
            };

            match outcome {
                WaitOutcome::Cancelled => break,
                WaitOutcome::IntervalChanged => reanchor(&mut schedule, &mut wake, &job.session_id),
                WaitOutcome::ControllerGone => {
                    warn!("capture controller dropped; session {} worker exiting", job.session_id);
                    break;
                }
                WaitOutcome::Elapsed => {}
            }
            continue;
        }

        schedule.advance();
        let sampled = time::timeout(
            job.cycle_timeout,
            sample(&job, &mut liveness, schedule.interval()),
        )
        .await;

        match sampled {
            Ok(Ok(sample)) => match persist(&job, &mut clock, sample).await {
                Ok(()) => {
                    let mut state = job.state.lock().await;
                    if state.session_id.as_deref() == Some(job.session_id.as_str()) {
                        state.sample_count += 1;
                    }
                    debug!(
                        "captured sample #{} for session {} (offline: {:?})",
                        state.sample_count,
                        job.session_id,
                        offline_reason(sample.verdict)
                    );
                }
                Err(err) => error!("capture cycle failed for session {}: {err:#}", job.session_id),
            },
            Ok(Err(err)) => {
                error!("capture cycle failed for session {}: {err:#}", job.session_id)
            }
            Err(_) => warn!(
                "capture cycle timeout (> {}s) session {}",
                job.cycle_timeout.as_secs(),
                job.session_id
            ),
        }

        let skipped = schedule.skip_missed(Instant::now());
        if skipped > 0 {
            warn!(
                "capture for session {} overran its interval; skipped {} tick(s)",
                job.session_id,
                skipped
            );
        }
    }

    info!("capture loop for session {} shutting down", job.session_id);
}

fn reanchor(schedule: &mut CaptureSchedule, wake: &mut watch::Receiver<u64>, session_id: &str) {
    let secs = *wake.borrow_and_update();
    schedule.reanchor(Instant::now(), Duration::from_secs(secs));
    info!("capture interval for session {session_id} re-anchored to {secs}s");
}

fn offline_reason(verdict: Liveness) -> Option<OfflineReason> {
    match verdict {
        Liveness::Online => None,
        Liveness::Offline(reason) => Some(reason),
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    reading: Option<MeterReading>,
    verdict: Liveness,
}

/// Reads, normalizes and classifies one sample. Nothing is written, so
/// abandoning this on timeout leaves the session untouched.
async fn sample(job: &CaptureJob, liveness: &mut LivenessDetector, interval: Duration) -> Result<Sample> {
    let raw = job
        .store
        .get(&paths::realtime(&job.device_id))
        .await
        .context("failed to read realtime telemetry")?;

    let reading = normalize(raw.as_ref());
    let verdict = liveness.observe(raw.as_ref(), reading.as_ref(), interval, Instant::now());
    Ok(Sample { reading, verdict })
}

/// Stamps and writes one record. The write is awaited to completion rather
/// than raced against the cycle timeout: a store can commit a write whose
/// reply nobody waits for, and the sample count must match what landed.
async fn persist(job: &CaptureJob, clock: &mut RecordClock, sample: Sample) -> Result<()> {
    let stamp = clock.stamp(Local::now());
    let record = CaptureRecord::new(stamp.label, sample.reading, sample.verdict);
    let value = serde_json::to_value(&record).context("failed to encode capture record")?;

    job.store
        .set(&paths::record(&job.device_id, &job.session_id, &stamp.key), value)
        .await
        .context("failed to persist capture record")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        capture::state::CapturePhase,
        store::{testing::ScriptedStore, DataStore, MemoryStore},
    };

    const DEVICE: &str = "meter-1";
    const SESSION: &str = "s1";

    struct Harness {
        state: Arc<Mutex<CaptureState>>,
        cancel: CancellationToken,
        wake: watch::Sender<u64>,
        handle: JoinHandle<()>,
    }

    impl Harness {
        async fn count(&self) -> u64 {
            self.state.lock().await.sample_count
        }
    }

    fn live_store() -> MemoryStore {
        MemoryStore::with_tree(json!({
            "devices": {DEVICE: {"RealTime": {"V1": 230.0, "A1": 0.5, "P_SUM": 0.115}}}
        }))
    }

    fn spawn_worker(store: SharedStore, interval_secs: u64, cycle_timeout: Duration) -> Harness {
        let mut state = CaptureState::new(interval_secs);
        state.phase = CapturePhase::Running;
        state.session_id = Some(SESSION.into());
        state.device_id = Some(DEVICE.into());
        let state = Arc::new(Mutex::new(state));

        let cancel = CancellationToken::new();
        let (wake, wake_rx) = watch::channel(interval_secs);
        let job = CaptureJob {
            device_id: DEVICE.into(),
            session_id: SESSION.into(),
            store,
            state: Arc::clone(&state),
            cycle_timeout,
        };
        let handle = tokio::spawn(capture_loop(job, cancel.clone(), wake_rx));
        Harness {
            state,
            cancel,
            wake,
            handle,
        }
    }

    async fn sleep_until_ms(start: Instant, ms: u64) {
        time::sleep_until(start + Duration::from_millis(ms)).await;
    }

    async fn records(store: &MemoryStore) -> Map<String, Value> {
        match store.get(&paths::session(DEVICE, SESSION)).await.unwrap() {
            Some(Value::Object(records)) => records,
            _ => Map::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_immediately_then_every_interval() {
        let store = live_store();
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store.clone()), 1, Duration::from_secs(10));

        sleep_until_ms(start, 3_500).await;
        assert_eq!(worker.count().await, 4);
        assert_eq!(records(&store).await.len(), 4);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_signal_reanchors_without_sampling() {
        let store = live_store();
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store), 5, Duration::from_secs(10));

        sleep_until_ms(start, 2_000).await;
        assert_eq!(worker.count().await, 1);
        // Same value still restarts the cadence from now.
        worker.wake.send(5).unwrap();

        sleep_until_ms(start, 6_900).await;
        assert_eq!(worker.count().await, 1);
        sleep_until_ms(start, 7_100).await;
        assert_eq!(worker.count().await, 2);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_skips_missed_ticks_instead_of_bursting() {
        let store = ScriptedStore::new(live_store()).delay_gets(&[Duration::from_millis(3_400)]);
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store), 1, Duration::from_secs(10));

        sleep_until_ms(start, 3_900).await;
        assert_eq!(worker.count().await, 1);
        sleep_until_ms(start, 4_500).await;
        assert_eq!(worker.count().await, 2);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_cycle_is_not_counted() {
        let memory = live_store();
        let store = ScriptedStore::new(memory.clone()).delay_gets(&[Duration::from_secs(30)]);
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store), 5, Duration::from_secs(2));

        sleep_until_ms(start, 2_500).await;
        assert_eq!(worker.count().await, 0);
        assert!(records(&memory).await.is_empty());
        // Next target was 5s; the abandoned cycle did not shift it.
        sleep_until_ms(start, 5_100).await;
        assert_eq!(worker.count().await, 1);
        assert_eq!(records(&memory).await.len(), 1);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_acknowledgement_still_counts_the_record() {
        // Each write lands at once but is acknowledged after 3s, past the
        // 2s cycle timeout.
        let memory = live_store();
        let store = ScriptedStore::new(memory.clone()).delay_set_replies(Duration::from_secs(3));
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store), 5, Duration::from_secs(2));

        sleep_until_ms(start, 3_100).await;
        assert_eq!(records(&memory).await.len(), 1);
        assert_eq!(worker.count().await, 1);

        sleep_until_ms(start, 8_100).await;
        assert_eq!(records(&memory).await.len(), 2);
        assert_eq!(worker.count().await, 2);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_do_not_stop_the_loop() {
        let memory = live_store();
        let store = ScriptedStore::new(memory.clone()).fail_sets(2);
        let start = Instant::now();
        let worker = spawn_worker(Arc::new(store), 1, Duration::from_secs(10));

        sleep_until_ms(start, 3_500).await;
        assert_eq!(worker.count().await, 2);
        assert_eq!(records(&memory).await.len(), 2);
        assert!(!worker.handle.is_finished());

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_realtime_is_recorded_offline_with_zeros() {
        let store = MemoryStore::new();
        let worker = spawn_worker(Arc::new(store.clone()), 3, Duration::from_secs(10));

        time::sleep(Duration::from_millis(100)).await;
        let records = records(&store).await;
        assert_eq!(records.len(), 1);
        let record = records.values().next().unwrap();
        assert_eq!(record["offline"], json!(true));
        assert_eq!(record["Voltage"], json!(0.0));
        assert_eq!(record["Power"], json!(0.0));
        assert!(record["timestamp"].is_string());
        // Offline samples still count.
        assert_eq!(worker.count().await, 1);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_observed_within_one_wait_slice() {
        let worker = spawn_worker(Arc::new(live_store()), 60, Duration::from_secs(10));

        time::sleep(Duration::from_secs(1)).await;
        worker.cancel.cancel();
        let joined = time::timeout(Duration::from_millis(250), worker.handle).await;
        assert!(joined.is_ok(), "worker still running after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn samples_for_a_replaced_session_are_not_counted() {
        let worker = spawn_worker(Arc::new(live_store()), 1, Duration::from_secs(10));

        time::sleep(Duration::from_millis(100)).await;
        worker.state.lock().await.session_id = Some("other".into());
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(worker.count().await, 1);

        worker.cancel.cancel();
        worker.handle.await.unwrap();
    }
}
