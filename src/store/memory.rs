use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{empty_object, is_empty_object, prune, split_path, write_at, DataStore};

/// Process-local store holding the whole tree as one JSON document.
///
/// Used when no persistence is wanted (`WATTLOG_STORE=memory`) and as the
/// store behind the capture tests.
#[derive(Clone)]
pub struct MemoryStore {
    root: Arc<Mutex<Value>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Mutex::new(empty_object())),
        }
    }

    /// Seeds the store with an existing tree.
    pub fn with_tree(tree: Value) -> Self {
        Self {
            root: Arc::new(Mutex::new(prune(tree).unwrap_or_else(empty_object))),
        }
    }

    /// Clone of the full tree, for inspection.
    pub fn snapshot(&self) -> Value {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = split_path(path)?;
        let root = self.lock();
        let mut node = &*root;
        for segment in segments {
            match node.get(segment) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        if is_empty_object(node) {
            return Ok(None);
        }
        Ok(Some(node.clone()))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let segments = split_path(path)?;
        let mut root = self.lock();
        write_at(&mut root, &segments, prune(value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let base = split_path(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let mut segments: Vec<String> = base.iter().map(|s| s.to_string()).collect();
            segments.extend(split_path(&key)?.into_iter().map(str::to_string));
            writes.push((segments, prune(value)));
        }

        let mut root = self.lock();
        for (segments, value) in writes {
            let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
            write_at(&mut root, &segments, value);
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        let mut root = self.lock();
        write_at(&mut root, &segments, None);
        Ok(())
    }
}
