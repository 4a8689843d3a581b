//! Hierarchical key-path data store.
//!
//! Every persisted value lives under a slash-separated path
//! (`devices/<id>/History/<session>/_meta`). Semantics follow a realtime
//! document database: writing `null` or an empty object deletes the node,
//! parents that become empty disappear, and reading a path returns the whole
//! subtree below it.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Capability the capture core persists through. Each call either succeeds
/// entirely or fails; there is no partial success.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Reads the subtree at `path`; `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replaces the subtree at `path` with `value`.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Writes each `(child, value)` pair below `path`, leaving siblings alone.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()>;

    /// Deletes the subtree at `path`.
    async fn remove(&self, path: &str) -> Result<()>;
}

pub type SharedStore = Arc<dyn DataStore>;

pub mod paths {
    pub const DEVICES: &str = "devices";
    pub const META_KEY: &str = "_meta";

    pub fn realtime(device_id: &str) -> String {
        format!("{DEVICES}/{device_id}/RealTime")
    }

    pub fn command(device_id: &str) -> String {
        format!("{DEVICES}/{device_id}/Command")
    }

    pub fn history(device_id: &str) -> String {
        format!("{DEVICES}/{device_id}/History")
    }

    pub fn session(device_id: &str, session_id: &str) -> String {
        format!("{DEVICES}/{device_id}/History/{session_id}")
    }

    pub fn session_meta(device_id: &str, session_id: &str) -> String {
        format!("{DEVICES}/{device_id}/History/{session_id}/{META_KEY}")
    }

    pub fn record(device_id: &str, session_id: &str, key: &str) -> String {
        format!("{DEVICES}/{device_id}/History/{session_id}/{key}")
    }
}

/// Splits a path into segments, rejecting characters that cannot appear in a key.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments {
        if segment
            .chars()
            .any(|c| matches!(c, '.' | '$' | '#' | '[' | ']') || c.is_control())
        {
            bail!("invalid path segment '{segment}' in '{path}'");
        }
    }
    Ok(segments)
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub(crate) fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

/// Drops `null` leaves and empty objects. `None` means nothing is left to store.
pub(crate) fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, child)| prune(child).map(|child| (key, child)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

/// Places `value` (or deletes, for `None`) at `segments` below `node`,
/// collapsing any object that ends up empty.
pub(crate) fn write_at(node: &mut Value, segments: &[&str], value: Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value.unwrap_or_else(empty_object);
        return;
    };

    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = empty_object();
    }

    if let Value::Object(map) = node {
        if value.is_none() && !map.contains_key(*head) {
            return;
        }
        let child = map.entry((*head).to_string()).or_insert_with(empty_object);
        write_at(child, rest, value);
        if is_empty_object(child) {
            map.remove(*head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prune_drops_nulls_and_empty_objects() {
        let pruned = prune(json!({"a": null, "b": {}, "c": {"d": 1, "e": null}}));
        assert_eq!(pruned, Some(json!({"c": {"d": 1}})));
        assert_eq!(prune(json!({"a": null})), None);
    }

    #[test]
    fn write_at_collapses_empty_parents() {
        let mut root = json!({"devices": {"m1": {"Command": {"resetEnergy": true}}}});
        write_at(&mut root, &["devices", "m1", "Command"], None);
        assert_eq!(root, json!({}));
    }

    #[test]
    fn split_path_rejects_reserved_characters() {
        assert!(split_path("devices/a.b").is_err());
        assert_eq!(split_path("/devices//m1/").unwrap(), vec!["devices", "m1"]);
    }
}
