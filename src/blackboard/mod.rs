//! Blackboard: the shared per-run JSON document cooperating agents use to
//! publish findings, claim files, and signal progress.
//!
//! Single-writer discipline: every mutation is a read-modify-write under the
//! exclusive lock file. Readers snapshot without the lock and accept mild
//! staleness. The document is value-typed and reloaded on every write; no
//! long-lived object graph.

mod lock;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::BlackboardConfig;
use crate::error::{ApiaryError, Result};
use crate::exec::FindingKind;

pub use lock::LockGuard;

pub const BLACKBOARD_FILE: &str = "blackboard.json";
const LOCK_FILE: &str = ".blackboard.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Active,
    Completed,
    Failed,
    Stale,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub task: String,
    pub state: AgentState,
    pub heartbeat_at: DateTime<Utc>,
    pub interests: Vec<String>,
    /// Index into `findings` of the next unseen item for this agent.
    pub cursor: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardFinding {
    pub id: String,
    pub agent_id: String,
    pub kind: FindingKind,
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub importance: Importance,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardMessage {
    pub from: String,
    pub to: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardTask {
    pub id: String,
    pub description: String,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardQuestion {
    pub id: String,
    pub agent_id: String,
    pub question: String,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    Completed,
    Expired,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimChain {
    pub chain_id: String,
    pub agent_id: String,
    pub files: BTreeSet<String>,
    pub reason: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ChainStatus,
}

impl ClaimChain {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ChainStatus::Active && self.expires_at > now
    }
}

/// Result of a claim attempt. A block is an expected coordination outcome,
/// not an error: the caller sees exactly which chains hold its files.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Granted { chain_id: String },
    Blocked { conflicts: Vec<ClaimChain> },
}

impl ClaimOutcome {
    pub fn chain_id(&self) -> Option<&str> {
        match self {
            Self::Granted { chain_id } => Some(chain_id),
            Self::Blocked { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardDoc {
    pub version: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentEntry>,
    pub findings: Vec<BoardFinding>,
    pub messages: Vec<BoardMessage>,
    pub task_queue: Vec<BoardTask>,
    pub questions: Vec<BoardQuestion>,
    pub claim_chains: BTreeMap<String, ClaimChain>,
}

impl BlackboardDoc {
    fn new(run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            version: "1.0".into(),
            run_id: run_id.to_string(),
            created_at: now,
            updated_at: now,
            agents: BTreeMap::new(),
            findings: Vec::new(),
            messages: Vec::new(),
            task_queue: Vec::new(),
            questions: Vec::new(),
            claim_chains: BTreeMap::new(),
        }
    }

    pub fn active_agents(&self) -> impl Iterator<Item = (&String, &AgentEntry)> {
        self.agents
            .iter()
            .filter(|(_, a)| a.state == AgentState::Active)
    }

    pub fn count_state(&self, state: AgentState) -> usize {
        self.agents.values().filter(|a| a.state == state).count()
    }

    pub fn critical_findings(&self) -> Vec<&BoardFinding> {
        self.findings
            .iter()
            .filter(|f| f.importance == Importance::Critical || f.kind == FindingKind::Blocker)
            .collect()
    }

    /// Lazy expiry: flip active chains whose TTL has passed. Called on
    /// every read-modify-write cycle.
    fn prune_expired_chains(&mut self, now: DateTime<Utc>) {
        for chain in self.claim_chains.values_mut() {
            if chain.status == ChainStatus::Active && chain.expires_at <= now {
                chain.status = ChainStatus::Expired;
            }
        }
    }
}

pub struct Blackboard {
    file: PathBuf,
    lock_path: PathBuf,
    config: BlackboardConfig,
}

impl Blackboard {
    /// Exclusive-create a fresh blackboard for a run. Fails with a conflict
    /// if one already exists in the coordination directory.
    pub fn create(dir: &Path, run_id: &str, config: BlackboardConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(BLACKBOARD_FILE);
        let doc = BlackboardDoc::new(run_id);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file)
        {
            Ok(mut f) => {
                use std::io::Write;
                f.write_all(&bytes)?;
                f.sync_all()?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ApiaryError::Duplicate(format!(
                    "blackboard at {}",
                    file.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(run_id = run_id, path = %file.display(), "Blackboard created");
        Ok(Self {
            lock_path: dir.join(LOCK_FILE),
            file,
            config,
        })
    }

    pub fn open(dir: &Path, config: BlackboardConfig) -> Result<Self> {
        let file = dir.join(BLACKBOARD_FILE);
        if !file.exists() {
            return Err(ApiaryError::JobNotFound(format!(
                "no blackboard at {}",
                file.display()
            )));
        }
        Ok(Self {
            lock_path: dir.join(LOCK_FILE),
            file,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Lock-free snapshot. May trail the latest write by one cycle.
    pub fn snapshot(&self) -> Result<BlackboardDoc> {
        let bytes = std::fs::read(&self.file)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ApiaryError::PermanentBackend(format!(
                "blackboard at {} is unreadable: {}",
                self.file.display(),
                e
            ))
        })
    }

    fn with_lock<T>(&self, op: impl FnOnce(&mut BlackboardDoc) -> Result<T>) -> Result<T> {
        let _guard = LockGuard::acquire(
            &self.lock_path,
            Duration::from_secs(self.config.lock_timeout_secs),
            Duration::from_secs(self.config.lock_break_glass_secs),
        )?;
        let mut doc = self.snapshot()?;
        let now = Utc::now();
        doc.prune_expired_chains(now);
        let value = op(&mut doc)?;
        doc.updated_at = now;
        self.write_atomic(&doc)?;
        Ok(value)
    }

    fn write_atomic(&self, doc: &BlackboardDoc) -> Result<()> {
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent registry
    // ------------------------------------------------------------------

    /// Idempotent by agent id: re-registration refreshes the heartbeat and
    /// task but never resets the cursor.
    pub fn register_agent(&self, agent_id: &str, task: &str, interests: &[String]) -> Result<()> {
        let agent_id = agent_id.to_string();
        let task = task.to_string();
        let interests = interests.to_vec();
        self.with_lock(move |doc| {
            let now = Utc::now();
            let cursor = doc.findings.len();
            let entry = doc.agents.entry(agent_id).or_insert_with(|| AgentEntry {
                task: String::new(),
                state: AgentState::Active,
                heartbeat_at: now,
                interests: Vec::new(),
                // New registrants only see findings from here on.
                cursor,
                registered_at: now,
            });
            entry.task = task;
            entry.interests = interests;
            entry.state = AgentState::Active;
            entry.heartbeat_at = now;
            Ok(())
        })
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<bool> {
        let agent_id = agent_id.to_string();
        self.with_lock(move |doc| {
            match doc.agents.get_mut(&agent_id) {
                Some(agent) => {
                    agent.heartbeat_at = Utc::now();
                    if agent.state == AgentState::Stale {
                        agent.state = AgentState::Active;
                    }
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    pub fn update_agent_state(&self, agent_id: &str, state: AgentState) -> Result<bool> {
        let agent_id = agent_id.to_string();
        self.with_lock(move |doc| {
            match doc.agents.get_mut(&agent_id) {
                Some(agent) => {
                    agent.state = state;
                    agent.heartbeat_at = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    // ------------------------------------------------------------------
    // Findings
    // ------------------------------------------------------------------

    pub fn add_finding(
        &self,
        agent_id: &str,
        kind: FindingKind,
        content: &str,
        files: &[String],
        importance: Importance,
        tags: &[String],
    ) -> Result<BoardFinding> {
        let agent_id = agent_id.to_string();
        let content = content.to_string();
        let files = files.to_vec();
        let tags = tags.to_vec();
        self.with_lock(move |doc| {
            let finding = BoardFinding {
                id: format!("finding-{}", doc.findings.len() + 1),
                agent_id,
                kind,
                content,
                files,
                importance,
                tags,
                created_at: Utc::now(),
            };
            doc.findings.push(finding.clone());
            Ok(finding)
        })
    }

    /// Findings added since this agent's cursor; advances the cursor.
    pub fn read_delta(&self, agent_id: &str) -> Result<Vec<BoardFinding>> {
        let agent_id = agent_id.to_string();
        self.with_lock(move |doc| {
            let total = doc.findings.len();
            let agent = doc
                .agents
                .get_mut(&agent_id)
                .ok_or_else(|| ApiaryError::JobNotFound(format!("agent {}", agent_id)))?;
            let cursor = agent.cursor.min(total);
            agent.cursor = total;
            Ok(doc.findings[cursor..].to_vec())
        })
    }

    // ------------------------------------------------------------------
    // Claim chains
    // ------------------------------------------------------------------

    /// All-or-nothing reservation of a file set. On overlap with any active
    /// chain the caller gets the blocking chains back and nothing is written.
    pub fn claim_chain(
        &self,
        agent_id: &str,
        files: &[String],
        reason: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome> {
        if files.is_empty() {
            return Err(ApiaryError::InvalidPayload {
                job_type: "claim_chain".into(),
                reason: "file set must not be empty".into(),
            });
        }
        let agent_id = agent_id.to_string();
        let files: BTreeSet<String> = files.iter().cloned().collect();
        let reason = reason.to_string();
        self.with_lock(move |doc| {
            if !doc.agents.contains_key(&agent_id) {
                return Err(ApiaryError::JobNotFound(format!(
                    "agent {} is not registered",
                    agent_id
                )));
            }
            let now = Utc::now();
            let conflicts: Vec<ClaimChain> = doc
                .claim_chains
                .values()
                .filter(|chain| chain.is_active(now))
                .filter(|chain| chain.files.intersection(&files).next().is_some())
                .cloned()
                .collect();
            if !conflicts.is_empty() {
                return Ok(ClaimOutcome::Blocked { conflicts });
            }
            let chain_id = format!("chain-{}", Uuid::new_v4().simple());
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(600));
            doc.claim_chains.insert(
                chain_id.clone(),
                ClaimChain {
                    chain_id: chain_id.clone(),
                    agent_id,
                    files,
                    reason,
                    claimed_at: now,
                    expires_at: now + ttl,
                    status: ChainStatus::Active,
                },
            );
            Ok(ClaimOutcome::Granted { chain_id })
        })
    }

    fn finish_chain(&self, agent_id: &str, chain_id: &str, status: ChainStatus) -> Result<()> {
        let agent_id = agent_id.to_string();
        let chain_id = chain_id.to_string();
        self.with_lock(move |doc| {
            let chain = doc
                .claim_chains
                .get_mut(&chain_id)
                .ok_or_else(|| ApiaryError::JobNotFound(format!("chain {}", chain_id)))?;
            if chain.agent_id != agent_id {
                return Err(ApiaryError::ClaimBlocked(format!(
                    "chain {} belongs to {}",
                    chain_id, chain.agent_id
                )));
            }
            chain.status = status;
            Ok(())
        })
    }

    pub fn release_chain(&self, agent_id: &str, chain_id: &str) -> Result<()> {
        self.finish_chain(agent_id, chain_id, ChainStatus::Released)
    }

    pub fn complete_chain(&self, agent_id: &str, chain_id: &str) -> Result<()> {
        self.finish_chain(agent_id, chain_id, ChainStatus::Completed)
    }

    // ------------------------------------------------------------------
    // Messages, tasks, questions
    // ------------------------------------------------------------------

    pub fn post_message(&self, from: &str, to: Option<&str>, content: &str) -> Result<()> {
        let message = BoardMessage {
            from: from.to_string(),
            to: to.map(str::to_string),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.with_lock(move |doc| {
            doc.messages.push(message);
            Ok(())
        })
    }

    pub fn push_task(&self, description: &str) -> Result<String> {
        let description = description.to_string();
        self.with_lock(move |doc| {
            let task = BoardTask {
                id: format!("task-{}", doc.task_queue.len() + 1),
                description,
                claimed_by: None,
                created_at: Utc::now(),
            };
            let id = task.id.clone();
            doc.task_queue.push(task);
            Ok(id)
        })
    }

    /// Claim the oldest unclaimed task, if any.
    pub fn take_task(&self, agent_id: &str) -> Result<Option<BoardTask>> {
        let agent_id = agent_id.to_string();
        self.with_lock(move |doc| {
            for task in doc.task_queue.iter_mut() {
                if task.claimed_by.is_none() {
                    task.claimed_by = Some(agent_id.clone());
                    return Ok(Some(task.clone()));
                }
            }
            Ok(None)
        })
    }

    pub fn ask_question(&self, agent_id: &str, question: &str) -> Result<String> {
        let agent_id = agent_id.to_string();
        let question = question.to_string();
        self.with_lock(move |doc| {
            let entry = BoardQuestion {
                id: format!("q-{}", doc.questions.len() + 1),
                agent_id,
                question,
                answer: None,
                answered_by: None,
                created_at: Utc::now(),
            };
            let id = entry.id.clone();
            doc.questions.push(entry);
            Ok(id)
        })
    }

    pub fn answer_question(&self, question_id: &str, answered_by: &str, answer: &str) -> Result<bool> {
        let question_id = question_id.to_string();
        let answered_by = answered_by.to_string();
        let answer = answer.to_string();
        self.with_lock(move |doc| {
            for question in doc.questions.iter_mut() {
                if question.id == question_id {
                    question.answer = Some(answer);
                    question.answered_by = Some(answered_by);
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Final cleanup: rename the document aside so a later run can create a
    /// fresh one. Returns the archive path.
    pub fn archive(&self) -> Result<PathBuf> {
        let archived = self.file.with_extension("archived.json");
        std::fs::rename(&self.file, &archived)?;
        debug!(path = %archived.display(), "Blackboard archived");
        Ok(archived)
    }
}
