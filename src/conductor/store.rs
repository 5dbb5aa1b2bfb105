//! Persistence for workflows, runs, node executions, and the conductor's
//! append-only decision log. One database per tenant.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::graph::{NodeDef, NodeKind, WorkflowDef};
use crate::error::{ApiaryError, ErrorKind, Result};
use crate::exec::{ExecOutcome, Finding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    FireNode,
    SkipNode,
    Retry,
    Abort,
    PhaseChange,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FireNode => "fire_node",
            Self::SkipNode => "skip_node",
            Self::Retry => "retry",
            Self::Abort => "abort",
            Self::PhaseChange => "phase_change",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: Option<String>,
    pub workflow_name: Option<String>,
    pub tenant_id: String,
    pub status: RunStatus,
    pub phase: String,
    pub input: Value,
    pub output: Value,
    pub context: Value,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_kind: NodeKind,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub prompt: String,
    pub prompt_hash: String,
    pub status: NodeStatus,
    pub result_json: Value,
    pub result_text: Option<String>,
    pub findings: Vec<Finding>,
    pub files_modified: Vec<String>,
    pub duration_ms: Option<u64>,
    pub token_count: Option<u64>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub run_id: String,
    pub kind: String,
    pub data: Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub struct RunStore {
    conn: Arc<Mutex<Connection>>,
}

impl RunStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(db_path).map_err(|e| ApiaryError::storage("open run store", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ApiaryError::storage("open run store", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                nodes_json TEXT NOT NULL,
                edges_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                workflow_name TEXT,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL DEFAULT 'init',
                input_json TEXT NOT NULL DEFAULT '{}',
                output_json TEXT NOT NULL DEFAULT '{}',
                context_json TEXT NOT NULL DEFAULT '{}',
                total_nodes INTEGER NOT NULL DEFAULT 0,
                completed_nodes INTEGER NOT NULL DEFAULT 0,
                failed_nodes INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_workflow
                ON workflow_runs(workflow_name, started_at DESC);

            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                node_kind TEXT NOT NULL,
                agent_id TEXT,
                session_id TEXT,
                prompt TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                result_json TEXT NOT NULL DEFAULT '{}',
                result_text TEXT,
                findings_json TEXT NOT NULL DEFAULT '[]',
                files_modified TEXT NOT NULL DEFAULT '[]',
                duration_ms INTEGER,
                token_count INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                error_kind TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_exec_run
                ON node_executions(run_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_exec_hash
                ON node_executions(prompt_hash, status);

            CREATE TABLE IF NOT EXISTS conductor_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                data_json TEXT NOT NULL DEFAULT '{}',
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_run
                ON conductor_decisions(run_id, id);
            ",
        )
        .map_err(|e| ApiaryError::storage("init run schema", e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub fn create_workflow(&self, def: &WorkflowDef) -> Result<String> {
        def.validate()?;
        let id = format!("wf-{}", Uuid::new_v4().simple());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workflows (id, name, description, nodes_json, edges_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                def.name,
                def.description,
                serde_json::to_string(&def.nodes)?,
                serde_json::to_string(&def.edges)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiaryError::Duplicate(format!("workflow '{}'", def.name))
            }
            other => ApiaryError::storage("create workflow", other),
        })?;
        debug!(workflow = %def.name, id = %id, "Workflow created");
        Ok(id)
    }

    pub fn get_workflow(&self, name: &str) -> Result<Option<(String, WorkflowDef)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, description, nodes_json, edges_json FROM workflows WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| ApiaryError::storage("get workflow", e))?
        .map(|(id, name, description, nodes_json, edges_json)| {
            let nodes: Vec<NodeDef> = serde_json::from_str(&nodes_json)?;
            let edges = serde_json::from_str(&edges_json)?;
            Ok((
                id,
                WorkflowDef {
                    name,
                    description,
                    nodes,
                    edges,
                },
            ))
        })
        .transpose()
    }

    pub fn list_workflows(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, description FROM workflows ORDER BY name")
            .map_err(|e| ApiaryError::storage("list workflows", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| ApiaryError::storage("list workflows", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ApiaryError::storage("list workflows", e))?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub fn create_run(
        &self,
        workflow_id: Option<&str>,
        workflow_name: Option<&str>,
        tenant_id: &str,
        input: &Value,
    ) -> Result<RunRecord> {
        let id = format!("r-{}", Uuid::new_v4().simple());
        let now = Utc::now();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO workflow_runs
                   (id, workflow_id, workflow_name, tenant_id, status, input_json, context_json, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7)",
                params![
                    id,
                    workflow_id,
                    workflow_name,
                    tenant_id,
                    serde_json::to_string(input)?,
                    serde_json::to_string(input)?,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| ApiaryError::storage("create run", e))?;
        }
        self.log_decision(
            &id,
            DecisionKind::FireNode,
            serde_json::json!({"workflow": workflow_name}),
            "Workflow run started",
        )?;
        self.get_run(&id)?
            .ok_or_else(|| ApiaryError::RunNotFound(id))
    }

    fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
        let status: String = row.get("status")?;
        let input: String = row.get("input_json")?;
        let output: String = row.get("output_json")?;
        let context: String = row.get("context_json")?;
        let started_at: String = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;
        Ok(RunRecord {
            id: row.get("id")?,
            workflow_id: row.get("workflow_id")?,
            workflow_name: row.get("workflow_name")?,
            tenant_id: row.get("tenant_id")?,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            phase: row.get("phase")?,
            input: serde_json::from_str(&input).unwrap_or(Value::Null),
            output: serde_json::from_str(&output).unwrap_or(Value::Null),
            context: serde_json::from_str(&context).unwrap_or(Value::Null),
            total_nodes: row.get("total_nodes")?,
            completed_nodes: row.get("completed_nodes")?,
            failed_nodes: row.get("failed_nodes")?,
            error_message: row.get("error_message")?,
            started_at: parse_ts(started_at),
            completed_at: completed_at.map(parse_ts),
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM workflow_runs WHERE id = ?1",
            params![run_id],
            Self::row_to_run,
        )
        .optional()
        .map_err(|e| ApiaryError::storage("get run", e))
    }

    /// Terminal statuses also stamp `completed_at`; a run is never mutated
    /// after that.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
        output: Option<&Value>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE workflow_runs SET status = ?1,
                completed_at = COALESCE(?2, completed_at),
                error_message = COALESCE(?3, error_message),
                output_json = COALESCE(?4, output_json)
             WHERE id = ?5 AND completed_at IS NULL",
            params![
                status.as_str(),
                completed_at,
                error_message,
                output.map(|o| serde_json::to_string(o).unwrap_or_default()),
                run_id,
            ],
        )
        .map_err(|e| ApiaryError::storage("update run status", e))?;
        Ok(())
    }

    pub fn update_run_phase(&self, run_id: &str, phase: &str) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE workflow_runs SET phase = ?1 WHERE id = ?2",
                params![phase, run_id],
            )
            .map_err(|e| ApiaryError::storage("update run phase", e))?;
        }
        self.log_decision(
            run_id,
            DecisionKind::PhaseChange,
            serde_json::json!({"new_phase": phase}),
            format!("Transitioned to {} phase", phase),
        )
    }

    pub fn update_run_context(&self, run_id: &str, context: &Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workflow_runs SET context_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(context)?, run_id],
        )
        .map_err(|e| ApiaryError::storage("update run context", e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node executions
    // ------------------------------------------------------------------

    pub fn record_node_start(
        &self,
        run_id: &str,
        node: &NodeDef,
        prompt: &str,
        prompt_hash: &str,
        agent_id: Option<&str>,
        retry_count: u32,
    ) -> Result<String> {
        let exec_id = format!("x-{}", Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO node_executions
                   (id, run_id, node_id, node_name, node_kind, agent_id, prompt, prompt_hash,
                    status, retry_count, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'running', ?9, ?10, ?10)",
                params![
                    exec_id,
                    run_id,
                    node.id,
                    node.display_name(),
                    node.kind.as_str(),
                    agent_id,
                    prompt,
                    prompt_hash,
                    retry_count,
                    now,
                ],
            )
            .map_err(|e| ApiaryError::storage("record node start", e))?;
            conn.execute(
                "UPDATE workflow_runs SET total_nodes = total_nodes + 1 WHERE id = ?1",
                params![run_id],
            )
            .map_err(|e| ApiaryError::storage("bump total_nodes", e))?;
        }
        self.log_decision(
            run_id,
            DecisionKind::FireNode,
            serde_json::json!({
                "node_id": node.id,
                "node_kind": node.kind.as_str(),
                "execution_id": exec_id,
                "retry_count": retry_count,
            }),
            format!("Started node: {}", node.display_name()),
        )?;
        Ok(exec_id)
    }

    pub fn record_node_completion(
        &self,
        exec_id: &str,
        outcome: &ExecOutcome,
        duration_ms: u64,
        token_count: Option<u64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let run_id: String = conn
            .query_row(
                "SELECT run_id FROM node_executions WHERE id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .map_err(|e| ApiaryError::storage("lookup execution", e))?;
        conn.execute(
            "UPDATE node_executions SET
                status = 'completed',
                result_json = ?1,
                result_text = ?2,
                findings_json = ?3,
                files_modified = ?4,
                duration_ms = ?5,
                token_count = ?6,
                completed_at = ?7
             WHERE id = ?8",
            params![
                serde_json::to_string(&outcome.result_json.clone().unwrap_or(Value::Null))?,
                outcome.result_text,
                serde_json::to_string(&outcome.findings)?,
                serde_json::to_string(&outcome.files_modified)?,
                duration_ms,
                token_count,
                Utc::now().to_rfc3339(),
                exec_id,
            ],
        )
        .map_err(|e| ApiaryError::storage("record completion", e))?;
        conn.execute(
            "UPDATE workflow_runs SET completed_nodes = completed_nodes + 1 WHERE id = ?1",
            params![run_id],
        )
        .map_err(|e| ApiaryError::storage("bump completed_nodes", e))?;
        Ok(())
    }

    pub fn record_node_failure(
        &self,
        exec_id: &str,
        error_kind: ErrorKind,
        error_message: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let run_id: String = conn
            .query_row(
                "SELECT run_id FROM node_executions WHERE id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .map_err(|e| ApiaryError::storage("lookup execution", e))?;
        conn.execute(
            "UPDATE node_executions SET
                status = 'failed',
                error_message = ?1,
                error_kind = ?2,
                duration_ms = ?3,
                completed_at = ?4
             WHERE id = ?5",
            params![
                error_message,
                error_kind.as_str(),
                duration_ms,
                Utc::now().to_rfc3339(),
                exec_id,
            ],
        )
        .map_err(|e| ApiaryError::storage("record failure", e))?;
        conn.execute(
            "UPDATE workflow_runs SET failed_nodes = failed_nodes + 1 WHERE id = ?1",
            params![run_id],
        )
        .map_err(|e| ApiaryError::storage("bump failed_nodes", e))?;
        Ok(())
    }

    /// Record a node that never fired (no incoming edge matched) or that was
    /// satisfied from the prompt cache.
    pub fn record_node_skipped(
        &self,
        run_id: &str,
        node: &NodeDef,
        reason: &str,
        cached: Option<&ExecOutcome>,
    ) -> Result<String> {
        let exec_id = format!("x-{}", Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO node_executions
                   (id, run_id, node_id, node_name, node_kind, prompt, prompt_hash, status,
                    result_json, result_text, findings_json, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '', '', 'skipped', ?6, ?7, ?8, ?9, ?9)",
                params![
                    exec_id,
                    run_id,
                    node.id,
                    node.display_name(),
                    node.kind.as_str(),
                    serde_json::to_string(
                        &cached.and_then(|c| c.result_json.clone()).unwrap_or(Value::Null)
                    )?,
                    cached.and_then(|c| c.result_text.clone()),
                    serde_json::to_string(&cached.map(|c| c.findings.clone()).unwrap_or_default())?,
                    now,
                ],
            )
            .map_err(|e| ApiaryError::storage("record skip", e))?;
        }
        self.log_decision(
            run_id,
            DecisionKind::SkipNode,
            serde_json::json!({"node_id": node.id, "execution_id": exec_id}),
            reason,
        )?;
        Ok(exec_id)
    }

    /// Most recent completed execution with this prompt hash in any run of
    /// the same workflow. Used for idempotent re-fires.
    pub fn find_cached(
        &self,
        workflow_name: &str,
        prompt_hash: &str,
    ) -> Result<Option<ExecOutcome>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT ne.result_json, ne.result_text, ne.findings_json, ne.files_modified
             FROM node_executions ne
             JOIN workflow_runs r ON ne.run_id = r.id
             WHERE ne.prompt_hash = ?1 AND ne.status = 'completed' AND r.workflow_name = ?2
             ORDER BY ne.created_at DESC LIMIT 1",
            params![prompt_hash, workflow_name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| ApiaryError::storage("cache lookup", e))?
        .map(|(result_json, result_text, findings_json, files_modified)| {
            let result_json: Value = serde_json::from_str(&result_json)?;
            Ok(ExecOutcome {
                result_json: (!result_json.is_null()).then_some(result_json),
                result_text,
                findings: serde_json::from_str(&findings_json)?,
                files_modified: serde_json::from_str(&files_modified)?,
            })
        })
        .transpose()
    }

    fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<NodeExecution> {
        let kind: String = row.get("node_kind")?;
        let status: String = row.get("status")?;
        let result_json: String = row.get("result_json")?;
        let findings: String = row.get("findings_json")?;
        let files: String = row.get("files_modified")?;
        let error_kind: Option<String> = row.get("error_kind")?;
        Ok(NodeExecution {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            node_id: row.get("node_id")?,
            node_name: row.get("node_name")?,
            node_kind: NodeKind::parse(&kind).unwrap_or(NodeKind::Single),
            agent_id: row.get("agent_id")?,
            session_id: row.get("session_id")?,
            prompt: row.get("prompt")?,
            prompt_hash: row.get("prompt_hash")?,
            status: NodeStatus::parse(&status).unwrap_or(NodeStatus::Failed),
            result_json: serde_json::from_str(&result_json).unwrap_or(Value::Null),
            result_text: row.get("result_text")?,
            findings: serde_json::from_str(&findings).unwrap_or_default(),
            files_modified: serde_json::from_str(&files).unwrap_or_default(),
            duration_ms: row.get("duration_ms")?,
            token_count: row.get("token_count")?,
            retry_count: row.get("retry_count")?,
            error_message: row.get("error_message")?,
            error_kind: error_kind.and_then(|k| ErrorKind::parse(&k)),
        })
    }

    pub fn get_node_executions(&self, run_id: &str) -> Result<Vec<NodeExecution>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM node_executions WHERE run_id = ?1 ORDER BY created_at, id")
            .map_err(|e| ApiaryError::storage("list executions", e))?;
        let rows = stmt
            .query_map(params![run_id], Self::row_to_execution)
            .map_err(|e| ApiaryError::storage("list executions", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ApiaryError::storage("list executions", e))?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Decision log
    // ------------------------------------------------------------------

    pub fn log_decision(
        &self,
        run_id: &str,
        kind: DecisionKind,
        data: Value,
        reason: impl AsRef<str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conductor_decisions (run_id, kind, data_json, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                kind.as_str(),
                serde_json::to_string(&data)?,
                reason.as_ref(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| ApiaryError::storage("log decision", e))?;
        Ok(())
    }

    pub fn get_decisions(&self, run_id: &str) -> Result<Vec<Decision>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT run_id, kind, data_json, reason, created_at
                 FROM conductor_decisions WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(|e| ApiaryError::storage("list decisions", e))?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| ApiaryError::storage("list decisions", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (run_id, kind, data, reason, created_at) =
                row.map_err(|e| ApiaryError::storage("list decisions", e))?;
            out.push(Decision {
                run_id,
                kind,
                data: serde_json::from_str(&data).unwrap_or(Value::Null),
                reason,
                created_at: parse_ts(created_at),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::graph::{EdgeDef, NodeConfig, START_NODE, END_NODE};
    use serde_json::json;

    fn sample_workflow() -> WorkflowDef {
        WorkflowDef {
            name: "triage".into(),
            description: "scan then fix".into(),
            nodes: vec![NodeDef {
                id: "scan".into(),
                name: None,
                kind: NodeKind::Single,
                prompt_template: "scan it".into(),
                config: NodeConfig::default(),
            }],
            edges: vec![
                EdgeDef {
                    from: START_NODE.into(),
                    to: "scan".into(),
                    condition: String::new(),
                    priority: 100,
                    on_failure: false,
                },
                EdgeDef {
                    from: "scan".into(),
                    to: END_NODE.into(),
                    condition: String::new(),
                    priority: 100,
                    on_failure: false,
                },
            ],
        }
    }

    #[test]
    fn test_workflow_round_trip() {
        let store = RunStore::in_memory().unwrap();
        store.create_workflow(&sample_workflow()).unwrap();
        let (_, def) = store.get_workflow("triage").unwrap().unwrap();
        assert_eq!(def.nodes.len(), 1);
        assert_eq!(def.edges.len(), 2);
        assert!(store.get_workflow("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_workflow_name_rejected() {
        let store = RunStore::in_memory().unwrap();
        store.create_workflow(&sample_workflow()).unwrap();
        let err = store.create_workflow(&sample_workflow()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_run_lifecycle_counts() {
        let store = RunStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).unwrap();
        let run = store
            .create_run(None, Some("triage"), "default", &json!({"task": "x"}))
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let exec_id = store
            .record_node_start(&run.id, &wf.nodes[0], "scan it", "hash-1", None, 0)
            .unwrap();
        store
            .record_node_completion(&exec_id, &ExecOutcome::from_text("done"), 12, Some(40))
            .unwrap();

        let run = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(run.total_nodes, 1);
        assert_eq!(run.completed_nodes, 1);
        assert_eq!(run.failed_nodes, 0);
    }

    #[test]
    fn test_terminal_run_never_mutated() {
        let store = RunStore::in_memory().unwrap();
        store.create_workflow(&sample_workflow()).unwrap();
        let run = store
            .create_run(None, Some("triage"), "default", &json!({}))
            .unwrap();
        store
            .update_run_status(&run.id, RunStatus::Completed, None, Some(&json!({"ok": 1})))
            .unwrap();
        let completed_at = store.get_run(&run.id).unwrap().unwrap().completed_at;
        assert!(completed_at.is_some());

        // A late failure write is ignored.
        store
            .update_run_status(&run.id, RunStatus::Failed, Some("late"), None)
            .unwrap();
        let run = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_at, completed_at);
    }

    #[test]
    fn test_cache_lookup_scoped_to_workflow() {
        let store = RunStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.create_workflow(&wf).unwrap();
        let run = store
            .create_run(None, Some("triage"), "default", &json!({}))
            .unwrap();
        let exec_id = store
            .record_node_start(&run.id, &wf.nodes[0], "scan it", "hash-9", None, 0)
            .unwrap();
        store
            .record_node_completion(
                &exec_id,
                &ExecOutcome::from_text("[fact] found it"),
                5,
                None,
            )
            .unwrap();

        let cached = store.find_cached("triage", "hash-9").unwrap().unwrap();
        assert_eq!(cached.findings.len(), 1);
        assert!(store.find_cached("other-flow", "hash-9").unwrap().is_none());
        assert!(store.find_cached("triage", "hash-0").unwrap().is_none());
    }

    #[test]
    fn test_decisions_append_only_in_order() {
        let store = RunStore::in_memory().unwrap();
        store.create_workflow(&sample_workflow()).unwrap();
        let run = store
            .create_run(None, Some("triage"), "default", &json!({}))
            .unwrap();
        store.update_run_phase(&run.id, "review").unwrap();
        let decisions = store.get_decisions(&run.id).unwrap();
        assert!(decisions.len() >= 2);
        assert_eq!(decisions.last().unwrap().kind, "phase_change");
    }
}
