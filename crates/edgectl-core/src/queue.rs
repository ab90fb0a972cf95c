// ── Persistent queue ──
//
// Store-and-forward buffer for outbound messages plus an append-only
// audit log of sensor readings, both in a local SQLite file. One
// controller process owns the file; single-statement atomicity is all
// the coordination needed.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::SensorReading;

pub const DEFAULT_DRAIN_LIMIT: u32 = 100;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS outbound_queue (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        topic     TEXT    NOT NULL,
        payload   BLOB    NOT NULL,
        timestamp INTEGER NOT NULL,
        sent      INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbound_unsent ON outbound_queue (sent, id)",
    "CREATE TABLE IF NOT EXISTS sensor_readings (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        sensor_id     TEXT    NOT NULL,
        value         REAL    NOT NULL,
        timestamp     INTEGER NOT NULL,
        controller_id TEXT    NOT NULL
    )",
];

/// One buffered outbound message.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Insertion time, Unix milliseconds.
    pub timestamp: i64,
    pub sent: bool,
}

impl QueueEntry {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub sent: i64,
    pub readings: i64,
}

pub struct PersistentQueue {
    pool: SqlitePool,
}

impl PersistentQueue {
    /// Open (creating if needed) the queue database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "opened persistent queue");
        Self::with_pool(pool).await
    }

    /// Volatile queue, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // The database lives only as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, CoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    // ── Outbound messages ────────────────────────────────────────────

    /// Durably append a message. Storage failures are logged and
    /// swallowed; `None` means the record was dropped.
    pub async fn enqueue(&self, topic: &str, payload: &[u8]) -> Option<i64> {
        match self.try_enqueue(topic, payload).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(topic, error = %e, "failed to enqueue outbound message");
                None
            }
        }
    }

    pub async fn try_enqueue(&self, topic: &str, payload: &[u8]) -> Result<i64, CoreError> {
        let id = sqlx::query(
            "INSERT INTO outbound_queue (topic, payload, timestamp, sent) VALUES (?, ?, ?, 0)",
        )
        .bind(topic)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Oldest unsent entries, FIFO, at most `limit`.
    pub async fn drain(&self, limit: u32) -> Result<Vec<QueueEntry>, CoreError> {
        self.drain_after(0, limit).await
    }

    /// Like [`drain`](Self::drain), starting after entry `after`. Lets a
    /// caller page past entries it chose to skip.
    pub async fn drain_after(&self, after: i64, limit: u32) -> Result<Vec<QueueEntry>, CoreError> {
        let entries = sqlx::query_as::<_, QueueEntry>(
            "SELECT id, topic, payload, timestamp, sent FROM outbound_queue \
             WHERE sent = 0 AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Flag an entry as delivered. Repeating the call is a no-op.
    pub async fn mark_sent(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE outbound_queue SET sent = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete sent entries older than `retention`. Unsent entries are
    /// never touched.
    pub async fn prune(&self, retention: Duration) -> Result<u64, CoreError> {
        let retention = chrono::Duration::from_std(retention).map_err(|e| CoreError::Config {
            message: format!("retention window out of range: {e}"),
        })?;
        self.prune_before(Utc::now() - retention).await
    }

    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let removed = sqlx::query("DELETE FROM outbound_queue WHERE sent = 1 AND timestamp < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            debug!(removed, "pruned sent queue entries");
        }
        Ok(removed)
    }

    // ── Audit log ────────────────────────────────────────────────────

    /// Append a reading to the audit log. Best-effort, like `enqueue`.
    pub async fn record_reading(&self, reading: &SensorReading) {
        let result = sqlx::query(
            "INSERT INTO sensor_readings (sensor_id, value, timestamp, controller_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&reading.sensor_id)
        .bind(reading.value)
        .bind(reading.timestamp.timestamp_millis())
        .bind(&reading.controller_id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(sensor = %reading.sensor_id, error = %e, "failed to record sensor reading");
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, CoreError> {
        let (pending, sent) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(CASE WHEN sent = 0 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN sent = 1 THEN 1 ELSE 0 END), 0) \
             FROM outbound_queue",
        )
        .fetch_one(&self.pool)
        .await?;
        let readings = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueStats {
            pending,
            sent,
            readings,
        })
    }

    /// Close the underlying pool. Later calls fail and are logged.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
