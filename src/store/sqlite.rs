//! SQLite-backed artifact store.
//!
//! The connection lives behind `Arc<Mutex<..>>` and every call runs on tokio's
//! blocking pool, so SQLite I/O never stalls async workers. The run snapshot is
//! stored as JSON next to a few indexed columns used for listing.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{ArtifactStore, RunEvent, RunEventKind, StoredPatch};
use crate::errors::StoreError;
use crate::model::{Patch, RunId, RunRecord};

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(anyhow::anyhow!("invalid timestamp '{}': {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<RunId, StoreError> {
    value
        .parse()
        .map_err(|e| StoreError::Database(anyhow::anyhow!("invalid run id '{}': {}", value, e)))
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(StoreError::Database)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
        db.init()?;
        Ok(db)
    }

    /// In-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                event TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS patches (
                run_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                patch TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, attempt)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target);
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
            ",
        )?;
        Ok(())
    }

    pub fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let record = serde_json::to_string(run).map_err(|source| StoreError::Serialization {
            what: "run record",
            source,
        })?;
        self.conn.execute(
            "INSERT INTO runs (id, target, state, attempts, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts,
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![
                run.id.to_string(),
                run.target.key(),
                run.state.as_str(),
                run.attempts,
                record,
                timestamp(run.created_at),
                timestamp(run.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_event(&self, run_id: RunId, kind: &RunEventKind) -> Result<(), StoreError> {
        let event = serde_json::to_string(kind).map_err(|source| StoreError::Serialization {
            what: "run event",
            source,
        })?;
        self.conn.execute(
            "INSERT INTO run_events (run_id, recorded_at, event) VALUES (?1, ?2, ?3)",
            params![run_id.to_string(), timestamp(Utc::now()), event],
        )?;
        Ok(())
    }

    pub fn insert_patch(&self, run_id: RunId, attempt: u32, patch: &Patch) -> Result<(), StoreError> {
        let json = serde_json::to_string(patch).map_err(|source| StoreError::Serialization {
            what: "patch",
            source,
        })?;
        self.conn.execute(
            "INSERT INTO patches (run_id, attempt, patch, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, attempt) DO NOTHING",
            params![run_id.to_string(), attempt, json, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            Some(json) => decode_run(&json),
            None => Err(StoreError::RunNotFound { id }),
        }
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(decode_run(&row?)?);
        }
        Ok(runs)
    }

    pub fn get_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, recorded_at, event FROM run_events WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, recorded_at, event) = row?;
            let kind = serde_json::from_str(&event).map_err(|source| {
                StoreError::Serialization {
                    what: "run event",
                    source,
                }
            })?;
            events.push(RunEvent {
                seq,
                run_id,
                recorded_at: parse_timestamp(&recorded_at)?,
                kind,
            });
        }
        Ok(events)
    }

    pub fn get_patches(&self, run_id: RunId) -> Result<Vec<StoredPatch>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, attempt, patch, created_at FROM patches WHERE run_id = ?1 ORDER BY attempt ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut patches = Vec::new();
        for row in rows {
            let (id, attempt, patch, created_at) = row?;
            patches.push(StoredPatch {
                run_id: parse_uuid(&id)?,
                attempt,
                patch: serde_json::from_str(&patch).map_err(|source| {
                    StoreError::Serialization {
                        what: "patch",
                        source,
                    }
                })?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(patches)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn decode_run(json: &str) -> Result<RunRecord, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::Serialization {
        what: "run record",
        source,
    })
}

/// Async handle to a [`RunDb`].
#[derive(Clone)]
pub struct SqliteArtifactStore {
    inner: Arc<Mutex<Option<RunDb>>>,
}

impl SqliteArtifactStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_db(RunDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_db(RunDb::new_in_memory()?))
    }

    fn from_db(db: RunDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(db))),
        }
    }

    /// Run a closure with the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            match guard.as_ref() {
                Some(db) => f(db),
                None => Err(StoreError::Closed),
            }
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let run = run.clone();
        self.call(move |db| db.upsert_run(&run)).await
    }

    async fn append_event(&self, run_id: RunId, kind: RunEventKind) -> Result<(), StoreError> {
        self.call(move |db| db.insert_event(run_id, &kind)).await
    }

    async fn save_patch(
        &self,
        run_id: RunId,
        attempt: u32,
        patch: &Patch,
    ) -> Result<(), StoreError> {
        let patch = patch.clone();
        self.call(move |db| db.insert_patch(run_id, attempt, &patch))
            .await
    }

    async fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError> {
        self.call(move |db| db.get_run(id)).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.call(move |db| db.list_runs(limit)).await
    }

    async fn events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        self.call(move |db| db.get_events(run_id)).await
    }

    async fn patches(&self, run_id: RunId) -> Result<Vec<StoredPatch>, StoreError> {
        self.call(move |db| db.get_patches(run_id)).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.call(move |db| db.get_setting(&key)).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.call(move |db| db.set_setting(&key, &value)).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            if let Some(db) = guard.take() {
                db.checkpoint()?;
                debug!("artifact store closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}
