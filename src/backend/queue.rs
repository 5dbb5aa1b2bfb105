//! Durable message queue with visibility leases, backed by SQLite.
//!
//! Models the subset of a cloud queue the dispatcher relies on: a received
//! message is hidden for the visibility window and reappears unless deleted
//! or the lease is extended. Delivery counting makes redelivery observable.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ApiaryError, Result};

/// A received message plus the receipt that proves lease ownership.
#[derive(Debug, Clone)]
pub struct QueueLease {
    pub message_id: i64,
    pub receipt: String,
    pub body: String,
    pub delivery_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<()>;

    /// Receive at most one visible message, hiding it for `visibility`.
    async fn receive(&self, visibility: Duration) -> Result<Option<QueueLease>>;

    /// Extend the lease on a held message (dispatch heartbeat).
    async fn extend(&self, lease: &QueueLease, visibility: Duration) -> Result<()>;

    /// Delete a message. Deleting an already-expired lease is a no-op; the
    /// message has been redelivered and belongs to someone else.
    async fn delete(&self, lease: &QueueLease) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(|e| ApiaryError::storage("open queue", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ApiaryError::storage("open queue", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                receipt TEXT,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_visible
                ON queue_messages(visible_at);
            ",
        )
        .map_err(|e| ApiaryError::storage("init queue schema", e))?;
        Ok(())
    }

    /// Number of messages currently hidden or visible.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM queue_messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(|e| ApiaryError::storage("queue depth", e))
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn send(&self, body: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_messages (body, visible_at, created_at) VALUES (?1, ?2, ?3)",
            params![body, Utc::now().to_rfc3339(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| ApiaryError::storage("queue send", e))?;
        debug!(body = body, "Message enqueued");
        Ok(())
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<QueueLease>> {
        let conn = self.conn.lock();
        let now = Utc::now();

        let row: Option<(i64, String, u32)> = conn
            .query_row(
                "SELECT id, body, delivery_count FROM queue_messages
                 WHERE visible_at <= ?1 ORDER BY id LIMIT 1",
                params![now.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| ApiaryError::storage("queue receive", e))?;

        let Some((id, body, delivery_count)) = row else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4().to_string();
        let hidden_until: DateTime<Utc> =
            now + chrono::Duration::from_std(visibility).unwrap_or(chrono::Duration::seconds(300));
        conn.execute(
            "UPDATE queue_messages
             SET visible_at = ?1, receipt = ?2, delivery_count = delivery_count + 1
             WHERE id = ?3",
            params![hidden_until.to_rfc3339(), receipt, id],
        )
        .map_err(|e| ApiaryError::storage("queue lease", e))?;

        Ok(Some(QueueLease {
            message_id: id,
            receipt,
            body,
            delivery_count: delivery_count + 1,
        }))
    }

    async fn extend(&self, lease: &QueueLease, visibility: Duration) -> Result<()> {
        let conn = self.conn.lock();
        let hidden_until = Utc::now()
            + chrono::Duration::from_std(visibility).unwrap_or(chrono::Duration::seconds(300));
        let updated = conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?1 WHERE id = ?2 AND receipt = ?3",
                params![hidden_until.to_rfc3339(), lease.message_id, lease.receipt],
            )
            .map_err(|e| ApiaryError::storage("queue extend", e))?;
        if updated == 0 {
            return Err(ApiaryError::StateConflict {
                job_id: lease.body.clone(),
                expected: "held lease".into(),
                actual: "lease lost".into(),
            });
        }
        Ok(())
    }

    async fn delete(&self, lease: &QueueLease) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND receipt = ?2",
                params![lease.message_id, lease.receipt],
            )
            .map_err(|e| ApiaryError::storage("queue delete", e))?;
        if deleted == 0 {
            debug!(
                message_id = lease.message_id,
                "Delete skipped: lease no longer held"
            );
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| ApiaryError::storage("queue ping", e))
    }
}
