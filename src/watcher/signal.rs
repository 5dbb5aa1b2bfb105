//! Escalation signal file: the only channel between watcher tiers.
//!
//! Created exclusively by tier-1 (so tier-2 never races a half-written
//! signal) and archived by tier-2 when handled. Present/absent is the
//! signal. The format is plain text so an operator can read it directly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ApiaryError, Result};

pub const SIGNAL_FILE: &str = "escalation.signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchReason {
    StaleAgents,
    ErrorsDetected,
    NoProgress,
}

impl WatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleAgents => "stale_agents",
            Self::ErrorsDetected => "errors_detected",
            Self::NoProgress => "no_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stale_agents" => Some(Self::StaleAgents),
            "errors_detected" => Some(Self::ErrorsDetected),
            "no_progress" => Some(Self::NoProgress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSignal {
    pub id: String,
    pub reason: WatchReason,
    pub created_at: DateTime<Utc>,
    pub stale_agents: Vec<String>,
    pub error_excerpts: Vec<String>,
    pub log_tail: Vec<String>,
}

impl EscalationSignal {
    pub fn new(reason: WatchReason) -> Self {
        Self {
            id: format!("esc-{}", Uuid::new_v4().simple()),
            reason,
            created_at: Utc::now(),
            stale_agents: Vec::new(),
            error_excerpts: Vec::new(),
            log_tail: Vec::new(),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("escalation: {}\n", self.id));
        out.push_str(&format!("reason: {}\n", self.reason.as_str()));
        out.push_str(&format!("created_at: {}\n", self.created_at.to_rfc3339()));
        out.push_str(&format!("stale_agents: {}\n", self.stale_agents.join(" ")));
        out.push_str("-- errors --\n");
        for line in &self.error_excerpts {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("-- log --\n");
        for line in &self.log_tail {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn parse(content: &str) -> Result<Self> {
        let mut id = None;
        let mut reason = None;
        let mut created_at = None;
        let mut stale_agents = Vec::new();
        let mut error_excerpts = Vec::new();
        let mut log_tail = Vec::new();
        let mut section = "";

        for line in content.lines() {
            match line {
                "-- errors --" => {
                    section = "errors";
                    continue;
                }
                "-- log --" => {
                    section = "log";
                    continue;
                }
                _ => {}
            }
            match section {
                "errors" => error_excerpts.push(line.to_string()),
                "log" => log_tail.push(line.to_string()),
                _ => {
                    if let Some(value) = line.strip_prefix("escalation: ") {
                        id = Some(value.to_string());
                    } else if let Some(value) = line.strip_prefix("reason: ") {
                        reason = WatchReason::parse(value);
                    } else if let Some(value) = line.strip_prefix("created_at: ") {
                        created_at = DateTime::parse_from_rfc3339(value)
                            .ok()
                            .map(|t| t.with_timezone(&Utc));
                    } else if let Some(value) = line.strip_prefix("stale_agents: ") {
                        stale_agents = value
                            .split_whitespace()
                            .map(str::to_string)
                            .collect();
                    }
                }
            }
        }

        Ok(Self {
            id: id.ok_or_else(|| {
                ApiaryError::PermanentBackend("signal file missing escalation id".into())
            })?,
            reason: reason.ok_or_else(|| {
                ApiaryError::PermanentBackend("signal file missing reason tag".into())
            })?,
            created_at: created_at.unwrap_or_else(Utc::now),
            stale_agents,
            error_excerpts,
            log_tail,
        })
    }

    /// Exclusive create. An existing signal means an escalation is already
    /// in flight; tier-1 treats that as "already escalated", not an error.
    pub fn write_exclusive(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SIGNAL_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(self.render().as_bytes())?;
                file.sync_all()?;
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ApiaryError::Duplicate(format!("signal at {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SIGNAL_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(SIGNAL_FILE).exists()
    }

    /// Move the handled signal aside; its absence is tier-1's "clear to
    /// resume" indication.
    pub fn archive(dir: &Path, id: &str) -> Result<PathBuf> {
        let path = dir.join(SIGNAL_FILE);
        let archived = dir.join(format!("{}.handled", id));
        std::fs::rename(&path, &archived)?;
        Ok(archived)
    }
}
