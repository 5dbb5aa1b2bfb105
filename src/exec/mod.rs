//! Executor strategies and the shared execution contract.
//!
//! A strategy turns a leased job (or a conductor-spawned agent) into an
//! [`ExecOutcome`]. Three implementations exist: in-process handler lookup,
//! container task launch, and a terminal-multiplexer pane for interactive
//! agent CLIs. Side effects are confined to the tenant workspace and the
//! artifact store.

pub mod inprocess;
pub mod multiplexer;
pub mod task_launch;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::BlobStore;
use crate::error::{ApiaryError, Result};
use crate::store::Job;
use crate::tenant::TenantScope;

pub use inprocess::InProcessStrategy;
pub use multiplexer::MultiplexerStrategy;
pub use task_launch::TaskLaunchStrategy;

/// Cooperative cancellation flag shared between a dispatcher worker and
/// whatever it is running. Checked at every subprocess boundary and between
/// loop iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(ApiaryError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Discovery,
    Warning,
    Decision,
    Blocker,
    Fact,
    Hypothesis,
    Question,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Warning => "warning",
            Self::Decision => "decision",
            Self::Blocker => "blocker",
            Self::Fact => "fact",
            Self::Hypothesis => "hypothesis",
            Self::Question => "question",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Self::Discovery),
            "warning" => Some(Self::Warning),
            "decision" => Some(Self::Decision),
            "blocker" => Some(Self::Blocker),
            "fact" => Some(Self::Fact),
            "hypothesis" => Some(Self::Hypothesis),
            "question" => Some(Self::Question),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub content: String,
}

/// Extract structured findings from agent output.
///
/// Line-prefix convention: `[fact] users are keyed by email`. Unknown
/// prefixes and plain prose lines are ignored.
pub fn parse_findings(text: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some((tag, content)) = rest.split_once(']') else {
            continue;
        };
        if let Some(kind) = FindingKind::from_prefix(tag.trim().to_ascii_lowercase().as_str()) {
            let content = content.trim();
            if !content.is_empty() {
                findings.push(Finding {
                    kind,
                    content: content.to_string(),
                });
            }
        }
    }
    findings
}

/// What every strategy returns: a structured result, the files the work
/// touched, and any findings extracted from the output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub result_json: Option<Value>,
    pub result_text: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ExecOutcome {
    pub fn from_json(value: Value) -> Self {
        Self {
            result_json: Some(value),
            ..Default::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            findings: parse_findings(&text),
            result_text: Some(text),
            ..Default::default()
        }
    }
}

/// Extends the queue lease and refreshes the job record while a long
/// handler runs. Without heartbeats the message reappears after the
/// visibility timeout and the job is considered lost by its worker.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<()>;
}

pub struct NoopHeartbeat;

#[async_trait]
impl Heartbeat for NoopHeartbeat {
    async fn beat(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything a strategy may touch while executing one job. Built by the
/// dispatcher; owns the tenant scope so all side effects stay inside the
/// tenant's workspace prefix and artifact prefix.
pub struct JobContext {
    pub job_id: String,
    pub worker_id: String,
    pub tenant: TenantScope,
    pub workspace_dir: PathBuf,
    pub artifact_prefix: String,
    pub blob: Arc<dyn BlobStore>,
    pub cancel: CancelToken,
    pub deadline: DateTime<Utc>,
    pub heartbeat: Arc<dyn Heartbeat>,
}

impl JobContext {
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn deadline_exceeded(&self) -> bool {
        Utc::now() >= self.deadline
    }

    /// Store a blob under this job's artifact prefix and return its key.
    pub async fn put_artifact(&self, name: &str, bytes: &[u8]) -> Result<String> {
        crate::ident::ensure_validated(name, crate::ident::IdentKind::Filename)?;
        let key = format!("{}/{}", self.artifact_prefix, name);
        self.blob.put(&key, bytes).await?;
        Ok(key)
    }
}

/// Spec for one conductor-spawned agent (single/parallel/swarm member).
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub agent_id: String,
    pub agent_type: String,
    pub prompt: String,
    pub run_id: String,
    pub node_id: String,
    pub workspace_dir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

#[async_trait]
pub trait ExecutorStrategy: Send + Sync {
    /// Execute a leased job end to end.
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Result<ExecOutcome>;

    /// Spawn a single agent on behalf of the conductor.
    async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome>;
}
