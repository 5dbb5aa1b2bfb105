use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ApiaryError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiaryConfig {
    pub paths: PathsConfig,
    pub auth: AuthConfig,
    pub dispatch: DispatchConfig,
    pub executor: ExecutorConfig,
    pub multiplexer: MultiplexerConfig,
    pub conductor: ConductorConfig,
    pub blackboard: BlackboardConfig,
    pub watcher: WatcherConfig,
    pub trail: TrailConfig,
    pub knowledge: KnowledgeConfig,
}

impl ApiaryConfig {
    pub async fn load(config_path: &Path) -> Result<Self> {
        let config = if config_path.exists() {
            let content = fs::read_to_string(config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config_path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ApiaryError::Config(e.to_string()))?;
        fs::write(config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.dispatch.worker_count == 0 {
            errors.push("dispatch.worker_count must be greater than 0");
        }
        if self.dispatch.visibility_timeout_secs == 0 {
            errors.push("dispatch.visibility_timeout_secs must be greater than 0");
        }
        if self.dispatch.job_deadline_secs == 0 {
            errors.push("dispatch.job_deadline_secs must be greater than 0");
        }
        if self.dispatch.cancel_grace_secs == 0 {
            errors.push("dispatch.cancel_grace_secs must be greater than 0");
        }

        if self.conductor.max_concurrent_nodes == 0 {
            errors.push("conductor.max_concurrent_nodes must be greater than 0");
        }

        if self.blackboard.lock_break_glass_secs <= self.blackboard.lock_timeout_secs {
            errors.push("blackboard.lock_break_glass_secs must exceed lock_timeout_secs");
        }
        if self.blackboard.claim_ttl_secs == 0 {
            errors.push("blackboard.claim_ttl_secs must be greater than 0");
        }

        if self.watcher.poll_interval_secs == 0 {
            errors.push("watcher.poll_interval_secs must be greater than 0");
        }
        if self.watcher.heartbeat_timeout_secs <= self.watcher.poll_interval_secs {
            errors.push("watcher.heartbeat_timeout_secs must exceed poll_interval_secs");
        }
        if self.watcher.max_failed_agents == 0 {
            errors.push("watcher.max_failed_agents must be greater than 0");
        }

        if self.trail.half_life_days <= 0.0 {
            errors.push("trail.half_life_days must be positive");
        }

        if !(0.0..=1.0).contains(&self.knowledge.similarity_threshold) {
            errors.push("knowledge.similarity_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.knowledge.recency_floor) {
            errors.push("knowledge.recency_floor must be between 0.0 and 1.0");
        }
        if self.knowledge.top_k == 0 {
            errors.push("knowledge.top_k must be greater than 0");
        }

        if self.auth.enabled && self.auth.credentials.is_empty() {
            errors.push("auth.credentials must not be empty when auth is enabled");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiaryError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which workspaces/, memory/ and artifacts/ live.
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".apiary"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// credential key -> tenant id. Tenant ids are validated at resolve time.
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub visibility_timeout_secs: u64,
    pub queue_poll_secs: u64,
    pub job_deadline_secs: u64,
    /// Grace between cooperative cancel and hard kill.
    pub cancel_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    /// QUEUED records older than this with no queue message are re-enqueued.
    pub reconcile_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            visibility_timeout_secs: 300,
            queue_poll_secs: 5,
            job_deadline_secs: 1800,
            cancel_grace_secs: 5,
            reconcile_interval_secs: 60,
            reconcile_grace_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    InProcess,
    TaskLaunch,
    Multiplexer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub strategy: StrategyKind,
    /// Task definition identifier handed to the task-launch API.
    pub task_definition: String,
    /// Container name targeted by the command override.
    pub container_name: String,
    /// Command run inside the launched task.
    pub worker_command: Vec<String>,
    /// Name (never the value) of the model-provider credential the task
    /// resolves from its own environment.
    pub credential_ref: String,
    pub status_poll_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::InProcess,
            task_definition: "apiary-worker".to_string(),
            container_name: "worker".to_string(),
            worker_command: vec!["apiary-worker".to_string()],
            credential_ref: "MODEL_API_KEY".to_string(),
            status_poll_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Session name prefix; the tenant id is appended.
    pub session_prefix: String,
    pub agent_command: String,
    pub pane_poll_secs: u64,
    pub result_timeout_secs: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            session_prefix: "apiary".to_string(),
            agent_command: "apiary-agent".to_string(),
            pane_poll_secs: 2,
            result_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub max_concurrent_nodes: usize,
    /// Applied when a node config carries no explicit retry_budget.
    pub default_retry_budget: u32,
    pub node_timeout_secs: u64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 4,
            default_retry_budget: 0,
            node_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboardConfig {
    pub lock_timeout_secs: u64,
    /// A lock whose holder heartbeat is older than this is broken.
    pub lock_break_glass_secs: u64,
    pub claim_ttl_secs: u64,
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            lock_break_glass_secs: 120,
            claim_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Failed-agent count at which tier-2 aborts the run.
    pub max_failed_agents: usize,
    pub log_tail_lines: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 40,
            heartbeat_timeout_secs: 120,
            max_failed_agents: 3,
            log_tail_lines: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub half_life_days: f64,
    pub default_ttl_hours: u64,
    pub flush_interval_ms: u64,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            half_life_days: 7.0,
            default_ttl_hours: 24,
            flush_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub top_k: usize,
    pub similarity_threshold: f64,
    pub failure_window_days: i64,
    pub recency_floor: f64,
    pub domain_boost: f64,
    pub max_context_tokens: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.30,
            failure_window_days: 30,
            recency_floor: 0.25,
            domain_boost: 1.5,
            max_context_tokens: 4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ApiaryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = ApiaryConfig::default();
        config.dispatch.worker_count = 0;
        config.watcher.poll_interval_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("worker_count"));
        assert!(err.contains("poll_interval_secs"));
    }

    #[test]
    fn test_auth_requires_credentials() {
        let mut config = ApiaryConfig::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
        config
            .auth
            .credentials
            .insert("key-1".to_string(), "acme".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = ApiaryConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ApiaryConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.dispatch.worker_count, config.dispatch.worker_count);
        assert_eq!(back.watcher.poll_interval_secs, 40);
    }
}
