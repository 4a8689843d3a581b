//! Store wrapper for tests that need slow or failing calls.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time;

use super::{DataStore, MemoryStore};

/// Delays selected calls and fails a set number of writes, otherwise
/// forwarding to a [`MemoryStore`].
pub(crate) struct ScriptedStore {
    inner: MemoryStore,
    get_delays: Mutex<VecDeque<Duration>>,
    set_reply_delay: Mutex<Option<Duration>>,
    failing_sets: AtomicU32,
    failing_updates: AtomicU32,
}

impl ScriptedStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            get_delays: Mutex::new(VecDeque::new()),
            set_reply_delay: Mutex::new(None),
            failing_sets: AtomicU32::new(0),
            failing_updates: AtomicU32::new(0),
        }
    }

    /// The next `get` calls wait for these durations, in order.
    pub(crate) fn delay_gets(self, delays: &[Duration]) -> Self {
        self.get_delays.lock().unwrap().extend(delays.iter().copied());
        self
    }

    /// Every `set` lands immediately but answers only after `delay`.
    pub(crate) fn delay_set_replies(self, delay: Duration) -> Self {
        *self.set_reply_delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn fail_sets(self, count: u32) -> Self {
        self.failing_sets.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_updates(self, count: u32) -> Self {
        self.failing_updates.store(count, Ordering::SeqCst);
        self
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DataStore for ScriptedStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let delay = self.get_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        if take_failure(&self.failing_sets) {
            return Err(anyhow!("store unavailable"));
        }
        self.inner.set(path, value).await?;
        let delay = *self.set_reply_delay.lock().unwrap();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        if take_failure(&self.failing_updates) {
            return Err(anyhow!("store unavailable"));
        }
        self.inner.update(path, fields).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(path).await
    }
}
