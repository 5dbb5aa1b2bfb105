//! Durable job records with CAS-serialized state transitions.
//!
//! One writer connection per store; transitions run in a transaction so
//! concurrent dispatchers racing for the same job see exactly one winner.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ApiaryError, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn allowed_transitions(&self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Queued => &[Running, Cancelled],
            Running => &[Succeeded, Failed],
            Succeeded | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        self.allowed_transitions().contains(&target)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_pointer: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            job_type: job_type.into(),
            payload,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            result_pointer: None,
            error_message: None,
            error_kind: None,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(db_path).map_err(|e| ApiaryError::storage("open job store", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ApiaryError::storage("open job store", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                result_pointer TEXT,
                error_message TEXT,
                error_kind TEXT,
                worker_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_tenant
                ON jobs(tenant_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_state
                ON jobs(state, updated_at);
            ",
        )
        .map_err(|e| ApiaryError::storage("init job schema", e))?;
        Ok(())
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
        let payload: String = row.get("payload")?;
        let state: String = row.get("state")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let error_kind: Option<String> = row.get("error_kind")?;
        Ok(Job {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            job_type: row.get("job_type")?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            state: JobState::parse(&state).unwrap_or(JobState::Failed),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            result_pointer: row.get("result_pointer")?,
            error_message: row.get("error_message")?,
            error_kind: error_kind.and_then(|k| ErrorKind::parse(&k)),
            worker_id: row.get("worker_id")?,
        })
    }

    pub fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (id, tenant_id, job_type, payload, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id,
                job.tenant_id,
                job.job_type,
                serde_json::to_string(&job.payload)?,
                job.state.as_str(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiaryError::Duplicate(format!("job {}", job.id))
            }
            other => ApiaryError::storage("insert job", other),
        })?;
        Ok(())
    }

    /// Tenant-scoped lookup. A job owned by another tenant is indistinguishable
    /// from a missing one.
    pub fn get(&self, tenant_id: &str, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM jobs WHERE id = ?1 AND tenant_id = ?2",
            params![job_id, tenant_id],
            Self::row_to_job,
        )
        .optional()
        .map_err(|e| ApiaryError::storage("get job", e))
    }

    /// Unscoped lookup for the dispatcher, which learns the tenant from the
    /// record itself.
    pub fn get_unscoped(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![job_id],
            Self::row_to_job,
        )
        .optional()
        .map_err(|e| ApiaryError::storage("get job", e))
    }

    pub fn list(&self, tenant_id: &str, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT * FROM jobs WHERE tenant_id = ?1");
        let mut args: Vec<String> = vec![tenant_id.to_string()];
        if let Some(state) = filter.state {
            args.push(state.as_str().to_string());
            sql.push_str(&format!(" AND state = ?{}", args.len()));
        }
        if let Some(job_type) = &filter.job_type {
            args.push(job_type.clone());
            sql.push_str(&format!(" AND job_type = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        let limit = filter.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {}", limit));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ApiaryError::storage("list jobs", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_job)
            .map_err(|e| ApiaryError::storage("list jobs", e))?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(|e| ApiaryError::storage("list jobs", e))?);
        }
        Ok(jobs)
    }

    /// Compare-and-swap state transition.
    ///
    /// Succeeds only when the current state equals `from` and the arrow is
    /// allowed. A repeated terminal write (current already equals `to` and
    /// `to` is terminal) is an idempotent no-op. `updated_at` stays monotonic
    /// even against clock slew.
    pub fn transition(&self, job_id: &str, from: JobState, update: TransitionUpdate) -> Result<Job> {
        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ApiaryError::storage("begin transition", e))?;

        let current = tx
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![job_id],
                Self::row_to_job,
            )
            .optional()
            .map_err(|e| ApiaryError::storage("read job", e))?
            .ok_or_else(|| ApiaryError::JobNotFound(job_id.to_string()))?;

        if current.state == update.to && update.to.is_terminal() {
            return Ok(current);
        }
        if current.state != from {
            return Err(ApiaryError::StateConflict {
                job_id: job_id.to_string(),
                expected: from.as_str().to_string(),
                actual: current.state.as_str().to_string(),
            });
        }
        if !from.can_transition_to(update.to) {
            return Err(ApiaryError::StateConflict {
                job_id: job_id.to_string(),
                expected: format!("transition from {}", from),
                actual: format!("disallowed target {}", update.to),
            });
        }

        let now = Utc::now().max(current.updated_at + Duration::milliseconds(1));
        tx.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2,
                result_pointer = COALESCE(?3, result_pointer),
                error_message = COALESCE(?4, error_message),
                error_kind = COALESCE(?5, error_kind),
                worker_id = COALESCE(?6, worker_id)
             WHERE id = ?7",
            params![
                update.to.as_str(),
                now.to_rfc3339(),
                update.result_pointer,
                update.error_message,
                update.error_kind.map(|k| k.as_str()),
                update.worker_id,
                job_id,
            ],
        )
        .map_err(|e| ApiaryError::storage("write transition", e))?;
        tx.commit()
            .map_err(|e| ApiaryError::storage("commit transition", e))?;

        debug!(job_id = job_id, from = %from, to = %update.to, "Job transitioned");

        let mut job = current;
        job.state = update.to;
        job.updated_at = now;
        Ok(job)
    }

    /// Refresh `updated_at` on a RUNNING job (dispatch heartbeat).
    pub fn touch(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2 AND state = 'RUNNING'
               AND updated_at < ?1",
            params![Utc::now().to_rfc3339(), job_id],
        )
        .map_err(|e| ApiaryError::storage("touch job", e))?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| ApiaryError::storage("job store ping", e))
    }

    /// QUEUED jobs older than the grace window, oldest first. The reconciler
    /// re-enqueues these in case the original enqueue was lost after the
    /// record write.
    pub fn stuck_queued(&self, grace: std::time::Duration) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let cutoff = Utc::now() - Duration::from_std(grace).unwrap_or(Duration::seconds(120));
        let mut stmt = conn
            .prepare(
                "SELECT id FROM jobs WHERE state = 'QUEUED' AND updated_at < ?1
                 ORDER BY updated_at ASC LIMIT 100",
            )
            .map_err(|e| ApiaryError::storage("scan queued", e))?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| row.get::<_, String>(0))
            .map_err(|e| ApiaryError::storage("scan queued", e))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(|e| ApiaryError::storage("scan queued", e))?);
        }
        Ok(ids)
    }
}

/// Fields written together with a CAS transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub to: JobState,
    pub result_pointer: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub worker_id: Option<String>,
}

impl TransitionUpdate {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_result_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.result_pointer = Some(pointer.into());
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_job(id: &str) -> JobStore {
        let store = JobStore::in_memory().unwrap();
        store
            .insert(&Job::new(id, "default", "echo", json!({"message": "hi"})))
            .unwrap();
        store
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = store_with_job("j-1");
        let job = store.get("default", "j-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.payload, json!({"message": "hi"}));
        assert!(store.get("other-tenant", "j-1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = store_with_job("j-1");
        let err = store
            .insert(&Job::new("j-1", "default", "echo", json!({})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_cas_single_winner() {
        let store = store_with_job("j-1");
        let won = store.transition(
            "j-1",
            JobState::Queued,
            TransitionUpdate::to(JobState::Running).with_worker("w-0"),
        );
        assert!(won.is_ok());

        // Second dispatcher loses the race.
        let lost = store.transition(
            "j-1",
            JobState::Queued,
            TransitionUpdate::to(JobState::Running).with_worker("w-1"),
        );
        assert!(matches!(lost, Err(ApiaryError::StateConflict { .. })));
    }

    #[test]
    fn test_terminal_write_is_idempotent() {
        let store = store_with_job("j-1");
        store
            .transition("j-1", JobState::Queued, TransitionUpdate::to(JobState::Running))
            .unwrap();
        store
            .transition(
                "j-1",
                JobState::Running,
                TransitionUpdate::to(JobState::Succeeded).with_result_pointer("p"),
            )
            .unwrap();
        // Duplicate terminal write: no-op, no error.
        let job = store
            .transition(
                "j-1",
                JobState::Running,
                TransitionUpdate::to(JobState::Succeeded),
            )
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result_pointer.as_deref(), Some("p"));
    }

    #[test]
    fn test_no_downgrade_from_terminal() {
        let store = store_with_job("j-1");
        store
            .transition("j-1", JobState::Queued, TransitionUpdate::to(JobState::Cancelled))
            .unwrap();
        let err = store
            .transition("j-1", JobState::Cancelled, TransitionUpdate::to(JobState::Running))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_updated_at_monotonic() {
        let store = store_with_job("j-1");
        let before = store.get("default", "j-1").unwrap().unwrap().updated_at;
        let after = store
            .transition("j-1", JobState::Queued, TransitionUpdate::to(JobState::Running))
            .unwrap()
            .updated_at;
        assert!(after > before);
    }

    #[test]
    fn test_failed_carries_error_kind() {
        let store = store_with_job("j-1");
        store
            .transition("j-1", JobState::Queued, TransitionUpdate::to(JobState::Running))
            .unwrap();
        store
            .transition(
                "j-1",
                JobState::Running,
                TransitionUpdate::to(JobState::Failed)
                    .with_error(ErrorKind::Timeout, "deadline exceeded"),
            )
            .unwrap();
        let job = store.get("default", "j-1").unwrap().unwrap();
        assert_eq!(job.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(job.error_message.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_stuck_queued_scan() {
        let store = store_with_job("j-1");
        // Fresh job is inside the grace window.
        assert!(store
            .stuck_queued(std::time::Duration::from_secs(60))
            .unwrap()
            .is_empty());
        // Zero grace flags it immediately.
        let stuck = store.stuck_queued(std::time::Duration::from_secs(0)).unwrap();
        assert_eq!(stuck, vec!["j-1".to_string()]);
    }

    #[test]
    fn test_list_filters() {
        let store = store_with_job("j-1");
        store
            .insert(&Job::new("j-2", "default", "workflow", json!({})))
            .unwrap();
        let echoes = store
            .list(
                "default",
                &JobFilter {
                    job_type: Some("echo".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].id, "j-1");

        let queued = store
            .list(
                "default",
                &JobFilter {
                    state: Some(JobState::Queued),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(queued.len(), 2);
    }
}
