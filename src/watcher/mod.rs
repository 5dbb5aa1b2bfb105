//! Tiered watcher over active swarm runs.
//!
//! Tier-1 is a cheap polling pass with a bounded decision set: it reads the
//! blackboard, never mutates agent state, and either keeps polling, creates
//! an escalation signal, or declares the run complete. Tier-2 runs only when
//! a signal exists, picks exactly one intervention, executes it by mutating
//! the blackboard, records the decision, and archives the signal.

mod signal;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::blackboard::{AgentState, Blackboard, BlackboardDoc, Importance};
use crate::config::{BlackboardConfig, WatcherConfig};
use crate::error::{ApiaryError, Result};
use crate::exec::{CancelToken, FindingKind};

pub use signal::{EscalationSignal, SIGNAL_FILE, WatchReason};

pub const WATCHER_LOG: &str = "watcher-log.txt";
pub const STOP_FILE: &str = "watcher-stop";
const DECISION_LOG: &str = "decisions.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier1Verdict {
    Nominal,
    Warning,
    InterventionNeeded,
    Complete,
}

impl Tier1Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Warning => "warning",
            Self::InterventionNeeded => "intervention_needed",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier2Action {
    Reassign,
    Restart,
    Abort,
    Synthesize,
    EscalateHuman,
}

impl Tier2Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reassign => "reassign",
            Self::Restart => "restart",
            Self::Abort => "abort",
            Self::Synthesize => "synthesize",
            Self::EscalateHuman => "escalate_human",
        }
    }
}

pub struct Watcher {
    coordination_dir: PathBuf,
    board: Blackboard,
    config: WatcherConfig,
}

impl Watcher {
    pub fn open(
        coordination_dir: &Path,
        config: WatcherConfig,
        blackboard: BlackboardConfig,
    ) -> Result<Self> {
        let board = Blackboard::open(coordination_dir, blackboard)?;
        Ok(Self {
            coordination_dir: coordination_dir.to_path_buf(),
            board,
            config,
        })
    }

    pub fn coordination_dir(&self) -> &Path {
        &self.coordination_dir
    }

    fn stale_agents(&self, doc: &BlackboardDoc) -> Vec<String> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        doc.active_agents()
            .filter(|(_, agent)| agent.heartbeat_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn error_excerpts(&self, doc: &BlackboardDoc) -> Vec<String> {
        let mut excerpts: Vec<String> = doc
            .critical_findings()
            .iter()
            .map(|f| format!("[{}] {}: {}", f.kind.as_str(), f.agent_id, f.content))
            .collect();
        excerpts.extend(
            doc.messages
                .iter()
                .filter(|m| m.content.to_ascii_lowercase().contains("error"))
                .map(|m| format!("message from {}: {}", m.from, m.content)),
        );
        excerpts.truncate(20);
        excerpts
    }

    fn log_line(&self, verdict: Tier1Verdict, doc: &BlackboardDoc, stale: &[String]) {
        let line = format!(
            "{} | STATUS: {} | active={} completed={} failed={} stale={}\n",
            Utc::now().to_rfc3339(),
            verdict.as_str(),
            doc.count_state(AgentState::Active),
            doc.count_state(AgentState::Completed),
            doc.count_state(AgentState::Failed),
            if stale.is_empty() {
                "none".to_string()
            } else {
                stale.join(",")
            },
        );
        let path = self.coordination_dir.join(WATCHER_LOG);
        if let Err(e) = append_line(&path, &line) {
            warn!(error = %e, "Watcher log append failed");
        }
    }

    fn log_tail(&self, lines: usize) -> Vec<String> {
        let path = self.coordination_dir.join(WATCHER_LOG);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                all[start..].iter().map(|s| s.to_string()).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// One tier-1 pass. Simple rules, bounded outcomes, no agent-state
    /// mutation; the only writes are the log line and (on escalation) the
    /// signal file.
    pub fn poll_once(&self) -> Result<Tier1Verdict> {
        if self.coordination_dir.join(STOP_FILE).exists() {
            return Ok(Tier1Verdict::Complete);
        }

        let doc = self.board.snapshot()?;
        let stale = self.stale_agents(&doc);
        let errors = self.error_excerpts(&doc);

        let all_terminal =
            !doc.agents.is_empty() && doc.agents.values().all(|a| a.state.is_terminal());
        let tasks_pending = doc
            .task_queue
            .iter()
            .any(|task| task.claimed_by.is_none());

        let verdict = if all_terminal && !tasks_pending {
            Tier1Verdict::Complete
        } else if !stale.is_empty() || !errors.is_empty() {
            Tier1Verdict::InterventionNeeded
        } else if doc.count_state(AgentState::Active) == 0 && !doc.agents.is_empty() {
            Tier1Verdict::Warning
        } else {
            Tier1Verdict::Nominal
        };

        self.log_line(verdict, &doc, &stale);

        match verdict {
            Tier1Verdict::InterventionNeeded => {
                let reason = if !stale.is_empty() {
                    WatchReason::StaleAgents
                } else {
                    WatchReason::ErrorsDetected
                };
                let mut signal = EscalationSignal::new(reason);
                signal.stale_agents = stale;
                signal.error_excerpts = errors;
                signal.log_tail = self.log_tail(self.config.log_tail_lines);
                match signal.write_exclusive(&self.coordination_dir) {
                    Ok(path) => {
                        info!(path = %path.display(), reason = reason.as_str(), "Escalation signalled");
                    }
                    Err(ApiaryError::Duplicate(_)) => {
                        // An unhandled escalation is already in flight.
                    }
                    Err(e) => return Err(e),
                }
            }
            Tier1Verdict::Complete => self.cleanup()?,
            Tier1Verdict::Nominal | Tier1Verdict::Warning => {}
        }
        Ok(verdict)
    }

    /// Final cleanup after a completed swarm: archive the blackboard and
    /// leave a stop marker so later passes exit immediately.
    fn cleanup(&self) -> Result<()> {
        let stop = self.coordination_dir.join(STOP_FILE);
        if !stop.exists() {
            std::fs::write(&stop, format!("completed at {}\n", Utc::now().to_rfc3339()))?;
            if self.board.path().exists() {
                self.board.archive()?;
            }
            info!(dir = %self.coordination_dir.display(), "Watcher cleanup complete");
        }
        Ok(())
    }

    /// Tier-2: handle the pending escalation. Chooses exactly one action by
    /// the documented priority order, executes it against the blackboard,
    /// appends a decision record, and archives the signal.
    pub fn handle_escalation(&self) -> Result<Tier2Action> {
        let signal = EscalationSignal::load(&self.coordination_dir)?.ok_or_else(|| {
            ApiaryError::JobNotFound(format!(
                "no escalation signal in {}",
                self.coordination_dir.display()
            ))
        })?;
        let doc = self.board.snapshot()?;
        let action = self.decide(&signal, &doc);
        self.execute(action, &signal, &doc)?;

        let record = format!(
            "{} | HANDLER: {} | escalation={} reason={} stale={}\n",
            Utc::now().to_rfc3339(),
            action.as_str(),
            signal.id,
            signal.reason.as_str(),
            signal.stale_agents.join(","),
        );
        append_line(&self.coordination_dir.join(DECISION_LOG), &record)?;
        EscalationSignal::archive(&self.coordination_dir, &signal.id)?;
        info!(action = action.as_str(), escalation = %signal.id, "Escalation handled");
        Ok(action)
    }

    /// Priority order: stuck/timeout, failure with partial output, failure
    /// without output, multiple-failure threshold, conflict/deadlock,
    /// default synthesize.
    fn decide(&self, signal: &EscalationSignal, doc: &BlackboardDoc) -> Tier2Action {
        if !signal.stale_agents.is_empty() {
            return Tier2Action::Restart;
        }

        let failed: Vec<&String> = doc
            .agents
            .iter()
            .filter(|(_, a)| a.state == AgentState::Failed)
            .map(|(id, _)| id)
            .collect();
        if !failed.is_empty() {
            let with_output = failed
                .iter()
                .any(|id| doc.findings.iter().any(|f| &f.agent_id == *id));
            if with_output {
                return Tier2Action::Synthesize;
            }
            if failed.len() < self.config.max_failed_agents {
                return Tier2Action::Reassign;
            }
            return Tier2Action::Abort;
        }

        let now = Utc::now();
        let contested_chains = doc
            .claim_chains
            .values()
            .filter(|c| c.is_active(now))
            .any(|c| {
                doc.agents
                    .get(&c.agent_id)
                    .is_some_and(|a| a.state != AgentState::Active)
            });
        let unanswered = doc.questions.iter().any(|q| q.answer.is_none());
        if contested_chains || unanswered {
            return Tier2Action::EscalateHuman;
        }

        Tier2Action::Synthesize
    }

    fn execute(
        &self,
        action: Tier2Action,
        signal: &EscalationSignal,
        doc: &BlackboardDoc,
    ) -> Result<()> {
        match action {
            Tier2Action::Restart => {
                for agent_id in &signal.stale_agents {
                    // Restart revives the entry with a fresh heartbeat; the
                    // run proceeds instead of timing out.
                    self.board.update_agent_state(agent_id, AgentState::Active)?;
                    self.board.post_message(
                        "watcher",
                        Some(agent_id),
                        "restarted after missed heartbeats",
                    )?;
                }
            }
            Tier2Action::Reassign => {
                for (agent_id, agent) in &doc.agents {
                    if agent.state == AgentState::Failed {
                        self.board.push_task(&format!(
                            "reassigned from {}: {}",
                            agent_id, agent.task
                        ))?;
                    }
                }
            }
            Tier2Action::Abort => {
                for (agent_id, agent) in &doc.agents {
                    if agent.state == AgentState::Active {
                        self.board.update_agent_state(agent_id, AgentState::Failed)?;
                    }
                }
                self.board.add_finding(
                    "watcher",
                    FindingKind::Blocker,
                    "run aborted: failure threshold exceeded",
                    &[],
                    Importance::Critical,
                    &[],
                )?;
            }
            Tier2Action::Synthesize => {
                self.board.add_finding(
                    "watcher",
                    FindingKind::Decision,
                    "synthesizing partial results from completed agents",
                    &[],
                    Importance::High,
                    &[],
                )?;
            }
            Tier2Action::EscalateHuman => {
                let path = self.coordination_dir.join("human-attention.txt");
                std::fs::write(
                    &path,
                    format!(
                        "escalation {} needs a human decision\nreason: {}\n",
                        signal.id,
                        signal.reason.as_str()
                    ),
                )?;
            }
        }
        Ok(())
    }

    /// Tier-1 loop: poll until the run completes or the watcher is
    /// cancelled. Escalations are handled inline by tier-2 and polling
    /// resumes once the signal is archived.
    pub async fn watch(&self, cancel: CancelToken) -> Result<Tier1Verdict> {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            cancel.ensure_active("watcher")?;
            let verdict = self.poll_once()?;
            match verdict {
                Tier1Verdict::Complete => return Ok(verdict),
                Tier1Verdict::InterventionNeeded => {
                    self.handle_escalation()?;
                }
                Tier1Verdict::Nominal | Tier1Verdict::Warning => {}
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::Blackboard;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Blackboard, Watcher) {
        let board =
            Blackboard::create(dir.path(), "r-1", BlackboardConfig::default()).unwrap();
        let watcher = Watcher::open(
            dir.path(),
            WatcherConfig::default(),
            BlackboardConfig::default(),
        )
        .unwrap();
        (board, watcher)
    }

    #[test]
    fn test_nominal_while_agents_heartbeat() {
        let dir = TempDir::new().unwrap();
        let (board, watcher) = setup(&dir);
        board.register_agent("a", "work", &[]).unwrap();
        assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::Nominal);
        assert!(!EscalationSignal::exists(dir.path()));
    }

    #[test]
    fn test_complete_when_all_terminal() {
        let dir = TempDir::new().unwrap();
        let (board, watcher) = setup(&dir);
        board.register_agent("a", "work", &[]).unwrap();
        board.update_agent_state("a", AgentState::Completed).unwrap();
        assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::Complete);
        // Cleanup archived the board and left the stop marker.
        assert!(dir.path().join(STOP_FILE).exists());
        assert!(!dir.path().join(crate::blackboard::BLACKBOARD_FILE).exists());
        // Subsequent polls exit immediately.
        assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::Complete);
    }

    #[test]
    fn test_tier1_never_mutates_agent_state() {
        let dir = TempDir::new().unwrap();
        let (board, watcher) = setup(&dir);
        board.register_agent("a", "work", &[]).unwrap();
        let before = board.snapshot().unwrap();
        watcher.poll_once().unwrap();
        let after = board.snapshot().unwrap();
        assert_eq!(
            serde_json::to_string(&before.agents).unwrap(),
            serde_json::to_string(&after.agents).unwrap()
        );
    }

    fn stale_watcher(dir: &TempDir) -> Watcher {
        let mut config = WatcherConfig::default();
        // Zero tolerance: every active agent is immediately stale.
        config.heartbeat_timeout_secs = 0;
        config.poll_interval_secs = 1;
        Watcher::open(dir.path(), config, BlackboardConfig::default()).unwrap()
    }

    #[test]
    fn test_stale_agent_escalates_and_tier2_restarts() {
        let dir = TempDir::new().unwrap();
        let board =
            Blackboard::create(dir.path(), "r-1", BlackboardConfig::default()).unwrap();
        board.register_agent("swarm-scout", "scan", &[]).unwrap();
        let watcher = stale_watcher(&dir);

        // Heartbeat timeout of zero makes the registered agent stale.
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);
        assert!(EscalationSignal::exists(dir.path()));

        // Second poll does not race the pending signal.
        assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);

        let action = watcher.handle_escalation().unwrap();
        assert_eq!(action, Tier2Action::Restart);
        assert!(!EscalationSignal::exists(dir.path()));

        // The restarted agent is active with a fresh heartbeat, so the next
        // poll is nominal again.
        let doc = board.snapshot().unwrap();
        assert_eq!(doc.agents["swarm-scout"].state, AgentState::Active);
        let healthy = Watcher::open(
            dir.path(),
            WatcherConfig::default(),
            BlackboardConfig::default(),
        )
        .unwrap();
        assert_eq!(healthy.poll_once().unwrap(), Tier1Verdict::Nominal);
    }

    #[test]
    fn test_tier2_reassigns_failures_without_output() {
        let dir = TempDir::new().unwrap();
        let (board, _) = setup(&dir);
        board.register_agent("a", "scan the parser", &[]).unwrap();
        board.register_agent("b", "other work", &[]).unwrap();
        board.update_agent_state("a", AgentState::Failed).unwrap();
        board
            .add_finding(
                "b",
                FindingKind::Blocker,
                "cannot proceed",
                &[],
                Importance::Critical,
                &[],
            )
            .unwrap();

        let watcher = Watcher::open(
            dir.path(),
            WatcherConfig::default(),
            BlackboardConfig::default(),
        )
        .unwrap();
        assert_eq!(
            watcher.poll_once().unwrap(),
            Tier1Verdict::InterventionNeeded
        );
        let action = watcher.handle_escalation().unwrap();
        assert_eq!(action, Tier2Action::Reassign);

        let doc = board.snapshot().unwrap();
        assert!(doc.task_queue.iter().any(|t| t.description.contains("scan the parser")));
    }

    #[test]
    fn test_tier2_aborts_past_failure_threshold() {
        let dir = TempDir::new().unwrap();
        let (board, _) = setup(&dir);
        for name in ["a", "b", "c"] {
            board.register_agent(name, "work", &[]).unwrap();
            board.update_agent_state(name, AgentState::Failed).unwrap();
        }
        board.register_agent("alive", "work", &[]).unwrap();
        board
            .add_finding(
                "alive",
                FindingKind::Warning,
                "error: everything failing",
                &[],
                Importance::Critical,
                &[],
            )
            .unwrap();

        // The critical finding comes from a live agent, so the "partial
        // output" branch does not trigger for the failed three.
        let watcher = Watcher::open(
            dir.path(),
            WatcherConfig::default(),
            BlackboardConfig::default(),
        )
        .unwrap();
        watcher.poll_once().unwrap();
        let action = watcher.handle_escalation().unwrap();
        assert_eq!(action, Tier2Action::Abort);

        let doc = board.snapshot().unwrap();
        assert_eq!(doc.agents["alive"].state, AgentState::Failed);
        assert!(doc.findings.iter().any(|f| f.kind == FindingKind::Blocker));
    }

    #[test]
    fn test_handle_without_signal_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (_board, watcher) = setup(&dir);
        let err = watcher.handle_escalation().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
