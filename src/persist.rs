//! Durable result recording.
//!
//! One row per (job, item key). The primary key makes re-applying an
//! already-recorded outcome a no-op, which is what keeps local recording
//! exactly-once while delivery to the remote service stays at-least-once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::model::Outcome;

/// Transactional, idempotent outcome store.
pub trait ResultPersistence: Send + Sync {
    /// Record a batch of outcomes in one transaction. Keys already present
    /// are left untouched; either every new row commits or none do.
    fn upsert_batch(&self, job_id: &str, outcomes: &[(String, Outcome)]) -> Result<()>;

    /// Of `keys`, return those with no recorded outcome yet, preserving the
    /// order of `keys`. This is the resume path that works even without a
    /// checkpoint file.
    fn unprocessed_keys(&self, job_id: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Tallies of recorded outcomes for a job.
    fn counts(&self, job_id: &str) -> Result<StoredCounts>;
}

/// Per-status row counts for one job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoredCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl StoredCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.duplicates
    }
}

/// SQLite-backed store. Owns the connection; all access goes through an
/// internal lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS outcomes (
                job_id      TEXT NOT NULL,
                item_key    TEXT NOT NULL,
                status      TEXT NOT NULL,
                external_id TEXT,
                detail      TEXT,
                error_kind  TEXT,
                message     TEXT,
                reason      TEXT,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (job_id, item_key)
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_status ON outcomes(job_id, status);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("result store lock poisoned".into()))
    }
}

impl ResultPersistence for SqliteStore {
    fn upsert_batch(&self, job_id: &str, outcomes: &[(String, Outcome)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO outcomes (
                    job_id, item_key, status, external_id, detail,
                    error_kind, message, reason, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(job_id, item_key) DO NOTHING",
            )?;

            let now = Utc::now().to_rfc3339();
            for (key, outcome) in outcomes {
                let (status, external_id, detail, error_kind, message, reason) = match outcome {
                    Outcome::Succeeded {
                        external_id,
                        detail,
                    } => (
                        "succeeded",
                        Some(external_id.clone()),
                        detail
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        None,
                        None,
                        None,
                    ),
                    Outcome::Duplicate { reason } => {
                        ("duplicate", None, None, None, None, Some(reason.clone()))
                    }
                    Outcome::Failed { kind, message } => (
                        "failed",
                        None,
                        None,
                        Some(kind.to_string()),
                        Some(message.clone()),
                        None,
                    ),
                };
                stmt.execute(params![
                    job_id, key, status, external_id, detail, error_kind, message, reason, now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn unprocessed_keys(&self, job_id: &str, keys: &[String]) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM outcomes WHERE job_id = ?1 AND item_key = ?2")?;

        let mut missing = Vec::new();
        for key in keys {
            if !stmt.exists(params![job_id, key])? {
                missing.push(key.clone());
            }
        }
        Ok(missing)
    }

    fn counts(&self, job_id: &str) -> Result<StoredCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM outcomes WHERE job_id = ?1 GROUP BY status",
        )?;

        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StoredCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "succeeded" => counts.succeeded = n as usize,
                "failed" => counts.failed = n as usize,
                "duplicate" => counts.duplicates = n as usize,
                _ => {}
            }
        }
        Ok(counts)
    }
}
