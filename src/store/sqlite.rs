use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::{empty_object, prune, split_path, write_at, DataStore};

/// Stamped into `PRAGMA user_version` once the `nodes` table exists.
const SCHEMA_VERSION: i32 = 1;

const NODES_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS nodes (path TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct SqliteStoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SqliteStoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// SQLite-backed tree store. One row per leaf, keyed by its full path; all
/// statements run on a dedicated thread that owns the connection.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteStoreInner>,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("wattlog-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite store")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result = ensure_schema(&mut conn);
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("SQLite store initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(SqliteStoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }
}

fn owned_segments(path: &str) -> Result<Vec<String>> {
    Ok(split_path(path)?.into_iter().map(str::to_string).collect())
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn parse_leaf(path: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("corrupt value stored at {path}"))
}

fn collect_rows<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn read_subtree(conn: &Connection, segments: &[String]) -> Result<Option<Value>> {
    let path = segments.join("/");

    let rows = if path.is_empty() {
        collect_rows(conn, "SELECT path, value FROM nodes", [])?
    } else {
        let exact: Option<String> = conn
            .query_row(
                "SELECT value FROM nodes WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(raw) = exact {
            return parse_leaf(&path, &raw).map(Some);
        }
        collect_rows(
            conn,
            "SELECT path, value FROM nodes WHERE path >= ?1 AND path < ?2",
            params![format!("{path}/"), format!("{path}0")],
        )?
    };

    if rows.is_empty() {
        return Ok(None);
    }

    let prefix_len = if path.is_empty() { 0 } else { path.len() + 1 };
    let mut tree = empty_object();
    for (full, raw) in rows {
        let relative: Vec<&str> = full[prefix_len..].split('/').collect();
        write_at(&mut tree, &relative, Some(parse_leaf(&full, &raw)?));
    }
    Ok(Some(tree))
}

fn flatten(prefix: String, value: Value, out: &mut Vec<(String, String)>) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(join(&prefix, &key), child, out)?;
            }
        }
        leaf => {
            if prefix.is_empty() {
                bail!("cannot store a bare value at the root");
            }
            out.push((prefix, serde_json::to_string(&leaf)?));
        }
    }
    Ok(())
}

fn write_subtree(tx: &Transaction<'_>, segments: &[String], value: Option<Value>) -> Result<()> {
    let path = segments.join("/");

    if path.is_empty() {
        tx.execute("DELETE FROM nodes", [])?;
    } else {
        tx.execute(
            "DELETE FROM nodes WHERE path = ?1 OR (path >= ?2 AND path < ?3)",
            params![path, format!("{path}/"), format!("{path}0")],
        )?;
    }

    let Some(value) = value else {
        return Ok(());
    };

    // A leaf sitting on an ancestor path would shadow the new subtree.
    for end in 1..segments.len() {
        tx.execute(
            "DELETE FROM nodes WHERE path = ?1",
            params![segments[..end].join("/")],
        )?;
    }

    let mut leaves = Vec::new();
    flatten(path, value, &mut leaves)?;
    let mut stmt = tx.prepare_cached("INSERT INTO nodes (path, value) VALUES (?1, ?2)")?;
    for (leaf_path, raw) in leaves {
        stmt.execute(params![leaf_path, raw])?;
    }
    Ok(())
}

fn apply_writes(conn: &mut Connection, writes: Vec<(Vec<String>, Option<Value>)>) -> Result<()> {
    let tx = conn.transaction().context("failed to open store transaction")?;
    for (segments, value) in writes {
        write_subtree(&tx, &segments, value)
            .with_context(|| format!("failed to write {}", segments.join("/")))?;
    }
    tx.commit().context("failed to commit store transaction")
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = owned_segments(path)?;
        self.execute(move |conn| read_subtree(conn, &segments)).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let segments = owned_segments(path)?;
        let value = prune(value);
        self.execute(move |conn| apply_writes(conn, vec![(segments, value)]))
            .await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let base = owned_segments(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let mut segments = base.clone();
            segments.extend(owned_segments(&key)?);
            writes.push((segments, prune(value)));
        }
        if writes.is_empty() {
            return Ok(());
        }
        self.execute(move |conn| apply_writes(conn, writes)).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let segments = owned_segments(path)?;
        self.execute(move |conn| apply_writes(conn, vec![(segments, None)]))
            .await
    }
}

/// Creates the leaf table in a fresh file and refuses files written by a
/// newer build.
fn ensure_schema(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read store schema version")?;

    if version > SCHEMA_VERSION {
        bail!("store schema version {version} is newer than supported version {SCHEMA_VERSION}");
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().context("failed to open schema transaction")?;
    tx.execute_batch(NODES_TABLE)
        .context("failed to create nodes table")?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("failed to stamp store schema version")?;
    tx.commit().context("failed to commit store schema")
}
