//! Durable checkpoint completion ledger.
//!
//! One row per (event_id, checkpoint_id), enforced by the primary key.
//! Inserts use `ON CONFLICT DO NOTHING` so concurrent first arrivals for the
//! same key resolve inside SQLite, and each write is a single statement or a
//! single transaction so a failure never leaves a partial row.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{TResult, TrackerError};
use crate::types::{CheckpointCompletion, CompletionKey, CompletionStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint_completions (
    event_id TEXT NOT NULL,
    category_id TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    checkpoint_name TEXT NOT NULL DEFAULT '',
    arrived_at TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('reached', 'synced')),
    over_speed INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    PRIMARY KEY (event_id, checkpoint_id)
);

CREATE INDEX IF NOT EXISTS idx_completions_status
ON checkpoint_completions(status);

CREATE INDEX IF NOT EXISTS idx_completions_checkpoint
ON checkpoint_completions(checkpoint_id);
"#;

const COLUMNS: &str = "event_id, category_id, checkpoint_id, checkpoint_name, arrived_at, \
                       status, over_speed, synced_at";

pub struct CheckpointLedger {
    conn: Mutex<Connection>,
}

impl CheckpointLedger {
    pub fn open(path: impl AsRef<Path>) -> TResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> TResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> TResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(CheckpointLedger {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> TResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire ledger lock".to_string()))
    }

    /// Insert a completion unless one already exists for its key.
    ///
    /// Returns true when a row was written.
    pub fn insert_if_absent(&self, completion: &CheckpointCompletion) -> TResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO checkpoint_completions
                (event_id, category_id, checkpoint_id, checkpoint_name, arrived_at,
                 status, over_speed, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(event_id, checkpoint_id) DO NOTHING",
            params![
                completion.event_id,
                completion.category_id,
                completion.checkpoint_id,
                completion.checkpoint_name,
                completion.arrived_at.to_rfc3339(),
                stored_status(completion.status)?,
                completion.over_speed,
                completion.synced_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(changed == 1)
    }

    /// All REACHED rows across every event, oldest arrival first
    pub fn list_unsynced(&self) -> TResult<Vec<CheckpointCompletion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoint_completions WHERE status = 'reached' ORDER BY arrived_at",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], completion_from_row)?;
        collect_rows(rows)
    }

    pub fn count_unsynced(&self) -> TResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoint_completions WHERE status = 'reached'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// REACHED → SYNCED.
    ///
    /// Returns true when the row transitioned, false when it was already
    /// SYNCED. A missing row is an error.
    pub fn mark_synced(&self, event_id: &str, checkpoint_id: &str) -> TResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE checkpoint_completions SET status = 'synced', synced_at = ?1
             WHERE event_id = ?2 AND checkpoint_id = ?3 AND status = 'reached'",
            params![Utc::now().to_rfc3339(), event_id, checkpoint_id],
        )?;
        if changed == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM checkpoint_completions
                 WHERE event_id = ?1 AND checkpoint_id = ?2)",
                params![event_id, checkpoint_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(TrackerError::UnknownCompletion {
                    event_id: event_id.to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                });
            }
        }
        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn get(&self, event_id: &str, checkpoint_id: &str) -> TResult<Option<CheckpointCompletion>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoint_completions WHERE event_id = ?1 AND checkpoint_id = ?2",
                    COLUMNS
                ),
                params![event_id, checkpoint_id],
                completion_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_key(&self, key: &CompletionKey) -> TResult<Option<CheckpointCompletion>> {
        self.get(&key.event_id, &key.checkpoint_id)
    }

    /// Latest completion for a checkpoint id in any event (diagnostics)
    pub fn get_by_checkpoint(&self, checkpoint_id: &str) -> TResult<Option<CheckpointCompletion>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoint_completions WHERE checkpoint_id = ?1
                     ORDER BY arrived_at DESC LIMIT 1",
                    COLUMNS
                ),
                params![checkpoint_id],
                completion_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every completion of one event, used to rehydrate a session
    pub fn list_for_event(&self, event_id: &str) -> TResult<Vec<CheckpointCompletion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoint_completions WHERE event_id = ?1 ORDER BY arrived_at",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![event_id], completion_from_row)?;
        collect_rows(rows)
    }

    /// Drop all rows of an event before a new attempt. Never called during a run.
    pub fn clear_event(&self, event_id: &str) -> TResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM checkpoint_completions WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(removed)
    }
}

/// Run a ledger call on the blocking pool so async callers never stall
pub async fn run_blocking<T, F>(ledger: &Arc<CheckpointLedger>, f: F) -> TResult<T>
where
    T: Send + 'static,
    F: FnOnce(&CheckpointLedger) -> TResult<T> + Send + 'static,
{
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || f(&ledger))
        .await
        .map_err(|e| TrackerError::Internal(format!("ledger task failed: {}", e)))?
}

fn stored_status(status: CompletionStatus) -> TResult<&'static str> {
    match status {
        CompletionStatus::NotReached => Err(TrackerError::Internal(
            "NOT_REACHED completions are never stored".to_string(),
        )),
        other => Ok(other.as_str()),
    }
}

fn completion_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointCompletion> {
    let arrived_at: String = row.get(4)?;
    let status: String = row.get(5)?;
    let synced_at: Option<String> = row.get(7)?;

    Ok(CheckpointCompletion {
        event_id: row.get(0)?,
        category_id: row.get(1)?,
        checkpoint_id: row.get(2)?,
        checkpoint_name: row.get(3)?,
        arrived_at: parse_timestamp(4, &arrived_at)?,
        status: CompletionStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown status {:?}", status).into(),
            )
        })?,
        over_speed: row.get(6)?,
        synced_at: synced_at
            .map(|s| parse_timestamp(7, &s))
            .transpose()?,
    })
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn collect_rows<I>(rows: I) -> TResult<Vec<CheckpointCompletion>>
where
    I: Iterator<Item = rusqlite::Result<CheckpointCompletion>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
