//! Typed capability surface the HTTP adapter calls. Framing (routes, JSON
//! shapes) lives outside the core; everything here is credential-scoped
//! through the tenant resolver and returns typed errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::backend::{
    BlobStore, FsBlobStore, JobQueue, ProcessLauncher, SqliteQueue, TaskLauncher,
};
use crate::blackboard::{AgentState, Blackboard, BLACKBOARD_FILE};
use crate::config::{ApiaryConfig, StrategyKind};
use crate::dispatch::Dispatcher;
use crate::error::{ApiaryError, Result};
use crate::exec::{
    ExecutorStrategy, InProcessStrategy, MultiplexerStrategy, TaskLaunchStrategy,
};
use crate::handlers::{
    AgentChatHandler, EchoHandler, HandlerRegistry, WorkflowHandler,
};
use crate::provider::{ScriptedProvider, TextProvider};
use crate::store::{Job, JobFilter, JobStore};
use crate::tenant::{TenantResolver, TenantScope};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Results at or under this size are inlined into the job view.
const INLINE_RESULT_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job: Job,
    /// Present when the terminal result was small enough to inline.
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub version: String,
    pub dependencies: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmAgentView {
    pub agent_id: String,
    pub state: AgentState,
    pub task: String,
    pub heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub run_id: String,
    pub agents: Vec<SwarmAgentView>,
    pub findings: usize,
    pub open_questions: usize,
}

pub struct CoreApi {
    resolver: TenantResolver,
    dispatcher: Arc<Dispatcher>,
    store: Arc<JobStore>,
    queue: Arc<dyn JobQueue>,
    blob: Arc<dyn BlobStore>,
    config: ApiaryConfig,
    data_dir: PathBuf,
}

impl CoreApi {
    /// Assemble the whole core from configuration: stores, queue, handler
    /// registry, executor strategy, and dispatcher. Process-wide state is
    /// built here once and threaded explicitly; nothing module-level.
    pub fn build(config: ApiaryConfig) -> Result<Arc<Self>> {
        Self::build_with_provider(config, Arc::new(ScriptedProvider::new()))
    }

    pub fn build_with_provider(
        config: ApiaryConfig,
        provider: Arc<dyn TextProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let data_dir = config.paths.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let store = Arc::new(JobStore::open(data_dir.join("jobs.db"))?);
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteQueue::open(data_dir.join("queue.db"))?);
        let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(data_dir.join("artifacts")));
        let resolver = TenantResolver::new(&config.auth)?;

        let handlers = Arc::new(HandlerRegistry::new());
        let strategy: Arc<dyn ExecutorStrategy> = match config.executor.strategy {
            StrategyKind::InProcess => Arc::new(InProcessStrategy::new(
                Arc::clone(&handlers),
                Arc::clone(&provider),
            )),
            StrategyKind::TaskLaunch => {
                let launcher: Arc<dyn TaskLauncher> = Arc::new(ProcessLauncher::new());
                Arc::new(TaskLaunchStrategy::new(
                    launcher,
                    Arc::clone(&blob),
                    config.executor.clone(),
                ))
            }
            StrategyKind::Multiplexer => {
                Arc::new(MultiplexerStrategy::new(config.multiplexer.clone()))
            }
        };

        handlers.register(Arc::new(EchoHandler::new()));
        handlers.register(Arc::new(AgentChatHandler::new(Arc::clone(&provider))));
        handlers.register(Arc::new(AgentChatHandler::named(
            "analytics",
            Arc::clone(&provider),
        )));
        handlers.register(Arc::new(WorkflowHandler::new(
            Arc::clone(&strategy),
            config.conductor.clone(),
            config.blackboard.clone(),
            config.knowledge.clone(),
            config.trail.clone(),
        )));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&blob),
            handlers,
            strategy,
            config.dispatch.clone(),
            &data_dir,
        ));

        Ok(Arc::new(Self {
            resolver,
            dispatcher,
            store,
            queue,
            blob,
            config,
            data_dir,
        }))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn config(&self) -> &ApiaryConfig {
        &self.config
    }

    fn scope(&self, credential: Option<&str>) -> Result<TenantScope> {
        let tenant_id = self.resolver.resolve(credential)?;
        TenantScope::new(&self.data_dir, &tenant_id)
    }

    pub async fn submit_job(
        &self,
        credential: Option<&str>,
        job_type: &str,
        payload: Value,
    ) -> Result<String> {
        let scope = self.scope(credential)?;
        self.dispatcher
            .submit(scope.tenant_id(), job_type, payload)
            .await
    }

    /// Tenant-scoped job fetch. Small terminal results are inlined from the
    /// blob store; larger ones stay behind the result pointer.
    pub async fn get_job(&self, credential: Option<&str>, job_id: &str) -> Result<JobView> {
        let scope = self.scope(credential)?;
        let job = self
            .store
            .get(scope.tenant_id(), job_id)?
            .ok_or_else(|| ApiaryError::JobNotFound(job_id.to_string()))?;

        let mut result = None;
        if let Some(pointer) = &job.result_pointer {
            match self.blob.get(pointer).await {
                Ok(Some(bytes)) if bytes.len() <= INLINE_RESULT_LIMIT => {
                    result = serde_json::from_slice(&bytes).ok();
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = job_id, error = %e, "Result fetch failed"),
            }
        }
        Ok(JobView { job, result })
    }

    pub async fn list_jobs(
        &self,
        credential: Option<&str>,
        filter: &JobFilter,
    ) -> Result<Vec<Job>> {
        let scope = self.scope(credential)?;
        self.store.list(scope.tenant_id(), filter)
    }

    pub async fn health(&self) -> HealthReport {
        let mut dependencies = BTreeMap::new();
        dependencies.insert("queue".to_string(), self.queue.ping().await.is_ok());
        dependencies.insert("store".to_string(), self.store.ping().is_ok());
        dependencies.insert("blob".to_string(), self.blob.ping().await.is_ok());
        HealthReport {
            ok: dependencies.values().all(|healthy| *healthy),
            version: VERSION.to_string(),
            dependencies,
        }
    }

    /// Blackboard summaries for every live swarm run of the tenant.
    pub async fn list_swarm_agents(
        &self,
        credential: Option<&str>,
    ) -> Result<Vec<SwarmSummary>> {
        let scope = self.scope(credential)?;
        let root = scope.workspace_root();
        let mut summaries = Vec::new();

        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let coordination = entry.path().join(".coordination");
            if !coordination.join(BLACKBOARD_FILE).exists() {
                continue;
            }
            let board = Blackboard::open(&coordination, self.config.blackboard.clone())?;
            let doc = board.snapshot()?;
            summaries.push(SwarmSummary {
                run_id: doc.run_id.clone(),
                agents: doc
                    .agents
                    .iter()
                    .map(|(id, agent)| SwarmAgentView {
                        agent_id: id.clone(),
                        state: agent.state,
                        task: agent.task.clone(),
                        heartbeat_at: agent.heartbeat_at,
                    })
                    .collect(),
                findings: doc.findings.len(),
                open_questions: doc.questions.iter().filter(|q| q.answer.is_none()).count(),
            });
        }
        summaries.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn api(dir: &TempDir) -> Arc<CoreApi> {
        let mut config = ApiaryConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        CoreApi::build(config).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_dependencies() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);
        let health = api.health().await;
        assert!(health.ok);
        assert_eq!(health.dependencies.len(), 3);
        assert!(health.dependencies["queue"]);
    }

    #[tokio::test]
    async fn test_submit_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);
        let job_id = api
            .submit_job(None, "echo", json!({"message": "hi"}))
            .await
            .unwrap();
        let view = api.get_job(None, &job_id).await.unwrap();
        // Payload byte-equal to what was submitted.
        assert_eq!(view.job.payload, json!({"message": "hi"}));
        assert!(view.result.is_none());
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_get() {
        let dir = TempDir::new().unwrap();
        let mut config = ApiaryConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.auth.enabled = true;
        config
            .auth
            .credentials
            .insert("key-a".into(), "tenant-a".into());
        config
            .auth
            .credentials
            .insert("key-b".into(), "tenant-b".into());
        let api = CoreApi::build(config).unwrap();

        let job_id = api
            .submit_job(Some("key-a"), "echo", json!({"message": "secret"}))
            .await
            .unwrap();

        // Tenant B sees not_found, never the record.
        let err = api.get_job(Some("key-b"), &job_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        // Unknown credential is rejected outright.
        assert!(api.get_job(Some("key-x"), &job_id).await.is_err());
        // The owner still sees it.
        assert!(api.get_job(Some("key-a"), &job_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir);
        let err = api.get_job(None, "j-missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
