//! Persistent event history in SQLite.
//!
//! [`EventStore`] keeps ingested events across daemon restarts, up to a
//! row cap. Past the cap the oldest rows are deleted, together with
//! `prune_batch` more so the next few writes skip the prune. Each record is
//! stored whole as JSON next to the columns the history query filters on.
//!
//! The connection is blocking; async callers go through `spawn_blocking`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vnids_config::StorageConfig;

use crate::event::{EventKind, EventRecord, Severity};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_micros    INTEGER NOT NULL,
    event_type   TEXT    NOT NULL,
    severity     INTEGER NOT NULL,
    signature_id INTEGER,
    src_ip       TEXT,
    dest_ip      TEXT,
    record       TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_micros DESC);
CREATE INDEX IF NOT EXISTS idx_events_severity ON events(severity);
CREATE INDEX IF NOT EXISTS idx_events_signature ON events(signature_id);
";

const INSERT: &str = "
INSERT INTO events (ts_micros, event_type, severity, signature_id, src_ip, dest_ip, record)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const SELECT_RECENT: &str = "
SELECT record FROM events
WHERE (?1 IS NULL OR ts_micros >= ?1)
  AND (?2 IS NULL OR severity <= ?2)
  AND (?3 IS NULL OR event_type = ?3)
ORDER BY ts_micros DESC, id DESC
LIMIT ?4
";

const DELETE_OLDEST: &str = "
DELETE FROM events WHERE id IN (
    SELECT id FROM events ORDER BY ts_micros ASC, id ASC LIMIT ?1
)
";

/// Errors from the event store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored event is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Filters for [`EventStore::recent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub severity_max: Option<Severity>,
    pub event_type: Option<EventKind>,
}

/// Write-side counters, reported by `get_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounters {
    pub inserted: u64,
    pub pruned: u64,
    pub write_errors: u64,
}

/// SQLite-backed event history.
#[derive(Debug)]
pub struct EventStore {
    conn: Mutex<Connection>,
    max_events: u64,
    prune_batch: u64,
    inserted: AtomicU64,
    pruned: AtomicU64,
    write_errors: AtomicU64,
}

impl EventStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let journal: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::with_connection(conn, config)?;
        info!(
            path = %path.display(),
            journal = %journal,
            rows = store.count()?,
            max_events = store.max_events,
            "event history opened"
        );
        Ok(store)
    }

    pub fn open_in_memory(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: &StorageConfig) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_events: config.max_events,
            prune_batch: config.prune_batch,
            inserted: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `records` in one transaction, then prune past the row cap.
    pub fn insert_batch(&self, records: &[Arc<EventRecord>]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let result = self.write(records);
        if result.is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn write(&self, records: &[Arc<EventRecord>]) -> Result<usize, StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT)?;
            for record in records {
                insert.execute(params![
                    record.timestamp.timestamp_micros(),
                    record.event_type.as_str(),
                    record.effective_severity().get(),
                    record.alert.as_ref().and_then(|a| i64::try_from(a.signature_id).ok()),
                    record.src_ip.map(|ip| ip.to_string()),
                    record.dest_ip.map(|ip| ip.to_string()),
                    serde_json::to_string(record.as_ref())?,
                ])?;
            }
        }
        let pruned = prune(&tx, self.max_events, self.prune_batch)?;
        tx.commit()?;

        self.inserted.fetch_add(records.len() as u64, Ordering::Relaxed);
        if pruned > 0 {
            debug!(pruned, max_events = self.max_events, "pruned oldest stored events");
            self.pruned.fetch_add(pruned, Ordering::Relaxed);
        }
        Ok(records.len())
    }

    /// Newest stored events first.
    pub fn recent(&self, query: &HistoryQuery) -> Result<Vec<EventRecord>, StorageError> {
        let conn = self.lock();
        let mut select = conn.prepare_cached(SELECT_RECENT)?;
        let rows = select.query_map(
            params![
                query.since.map(|t| t.timestamp_micros()),
                query.severity_max.map(Severity::get),
                query.event_type.as_ref().map(EventKind::as_str),
                i64::try_from(query.limit).unwrap_or(i64::MAX),
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for json in rows {
            events.push(serde_json::from_str(&json?)?);
        }
        Ok(events)
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            inserted: self.inserted.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

fn prune(conn: &Connection, max_events: u64, batch: u64) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    let count = u64::try_from(count).unwrap_or(0);
    if count <= max_events {
        return Ok(0);
    }
    let excess = (count - max_events).saturating_add(batch);
    let deleted = conn.execute(DELETE_OLDEST, params![i64::try_from(excess).unwrap_or(i64::MAX)])?;
    Ok(deleted as u64)
}
