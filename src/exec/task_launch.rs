//! Task-launch strategy: each job runs as a launched task (a container in
//! the cloud deployment, a child process locally). The task reads its
//! assignment from validated environment variables, writes its result to the
//! artifact store, and reports through its exit code.
//!
//! Exit code contract: 0 success, 1 handler-reported failure, 2
//! configuration error, anything else a crash.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{AgentSpec, ExecOutcome, ExecutorStrategy, JobContext};
use crate::backend::{BlobStore, LaunchSpec, LaunchStatus, TaskHandle, TaskLauncher};
use crate::config::ExecutorConfig;
use crate::error::{ApiaryError, Result};
use crate::ident::{self, IdentKind};
use crate::store::Job;

const RESULT_BLOB: &str = "result.json";
const ERROR_BLOB: &str = "error.json";

pub struct TaskLaunchStrategy {
    launcher: Arc<dyn TaskLauncher>,
    blob: Arc<dyn BlobStore>,
    config: ExecutorConfig,
}

impl TaskLaunchStrategy {
    pub fn new(
        launcher: Arc<dyn TaskLauncher>,
        blob: Arc<dyn BlobStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            launcher,
            blob,
            config,
        }
    }

    /// Assemble the launch environment. Every value is either a validated
    /// identifier or a path derived from one; anything else aborts loudly as
    /// a security error because a caller bypassed validation.
    fn build_env(
        &self,
        job_id: &str,
        tenant_id: &str,
        node_id: Option<&str>,
        workspace_dir: &std::path::Path,
        artifact_prefix: &str,
    ) -> Result<Vec<(String, String)>> {
        ident::ensure_validated(job_id, IdentKind::Run)?;
        ident::ensure_validated(tenant_id, IdentKind::Tenant)?;
        let mut env = vec![
            ("JOB_ID".to_string(), job_id.to_string()),
            ("TENANT_ID".to_string(), tenant_id.to_string()),
            (
                "WORKSPACE_DIR".to_string(),
                workspace_dir.to_string_lossy().into_owned(),
            ),
            ("ARTIFACT_PREFIX".to_string(), artifact_prefix.to_string()),
            (
                "MODEL_CREDENTIAL_REF".to_string(),
                self.config.credential_ref.clone(),
            ),
        ];
        if let Some(node_id) = node_id {
            ident::ensure_validated(node_id, IdentKind::Node)?;
            env.push(("NODE_ID".to_string(), node_id.to_string()));
        }
        Ok(env)
    }

    fn launch_spec(
        &self,
        env: Vec<(String, String)>,
        workspace_dir: &std::path::Path,
    ) -> Result<LaunchSpec> {
        ident::ensure_validated(&self.config.task_definition, IdentKind::Workflow)?;
        Ok(LaunchSpec {
            task_definition: self.config.task_definition.clone(),
            container_name: self.config.container_name.clone(),
            command: self.config.worker_command.clone(),
            env,
            working_dir: Some(workspace_dir.to_path_buf()),
        })
    }

    /// Poll the task to termination, heart-beating the job lease. Returns
    /// the exit code or cancels/kills on deadline and cancellation.
    async fn wait_for_exit(&self, ctx: &JobContext, handle: &TaskHandle) -> Result<i32> {
        let poll = Duration::from_secs(self.config.status_poll_secs.max(1));
        loop {
            if ctx.cancel.is_cancelled() {
                self.launcher.stop(handle).await?;
                return Err(ApiaryError::Cancelled(format!("task {}", handle.task_id)));
            }
            if ctx.deadline_exceeded() {
                self.launcher.stop(handle).await?;
                return Err(ApiaryError::Timeout(format!(
                    "task {} exceeded its deadline",
                    handle.task_id
                )));
            }
            match self.launcher.status(handle).await? {
                LaunchStatus::Exited(code) => return Ok(code),
                LaunchStatus::Running => {
                    if let Err(e) = ctx.heartbeat.beat().await {
                        warn!(task_id = %handle.task_id, error = %e, "Heartbeat failed");
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    async fn read_outcome(&self, artifact_prefix: &str, exit_code: i32) -> Result<ExecOutcome> {
        match exit_code {
            0 => {
                let key = format!("{}/{}", artifact_prefix, RESULT_BLOB);
                let bytes = self.blob.get(&key).await?.ok_or_else(|| {
                    ApiaryError::Handler(format!("task exited 0 but wrote no {}", key))
                })?;
                let outcome: ExecOutcome = serde_json::from_slice(&bytes)
                    .or_else(|_| {
                        serde_json::from_slice::<Value>(&bytes).map(ExecOutcome::from_json)
                    })
                    .map_err(|e| ApiaryError::Handler(format!("unreadable result blob: {}", e)))?;
                Ok(outcome)
            }
            1 => {
                let key = format!("{}/{}", artifact_prefix, ERROR_BLOB);
                let detail = match self.blob.get(&key).await? {
                    Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    None => "task reported failure without detail".to_string(),
                };
                Err(ApiaryError::Handler(detail))
            }
            2 => Err(ApiaryError::Config(
                "task reported a configuration error".into(),
            )),
            other => Err(ApiaryError::Handler(format!(
                "task crashed with exit code {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl ExecutorStrategy for TaskLaunchStrategy {
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Result<ExecOutcome> {
        let env = self.build_env(
            &job.id,
            &job.tenant_id,
            None,
            &ctx.workspace_dir,
            &ctx.artifact_prefix,
        )?;
        let spec = self.launch_spec(env, &ctx.workspace_dir)?;
        let handle = self.launcher.launch(spec).await?;
        debug!(job_id = %job.id, task_id = %handle.task_id, "Job task launched");

        let exit_code = self.wait_for_exit(ctx, &handle).await?;
        self.read_outcome(&ctx.artifact_prefix, exit_code).await
    }

    async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome> {
        ident::ensure_validated(&spec.agent_id, IdentKind::Agent)?;
        ident::ensure_validated(&spec.run_id, IdentKind::Run)?;
        ident::ensure_validated(&spec.node_id, IdentKind::Node)?;

        // The agent reads its prompt from the workspace rather than argv so
        // prompt content never crosses a shell boundary.
        let prompt_name = format!("prompt-{}.json", spec.agent_id);
        let prompt_path = spec.workspace_dir.join(&prompt_name);
        tokio::fs::create_dir_all(&spec.workspace_dir).await?;
        tokio::fs::write(
            &prompt_path,
            serde_json::to_vec(&serde_json::json!({
                "agent_id": spec.agent_id,
                "agent_type": spec.agent_type,
                "run_id": spec.run_id,
                "node_id": spec.node_id,
                "prompt": spec.prompt,
            }))?,
        )
        .await?;

        let artifact_prefix = format!("agents/{}/{}", spec.run_id, spec.agent_id);
        let mut env = vec![
            ("JOB_ID".to_string(), spec.run_id.clone()),
            ("NODE_ID".to_string(), spec.node_id.clone()),
            (
                "WORKSPACE_DIR".to_string(),
                spec.workspace_dir.to_string_lossy().into_owned(),
            ),
            ("ARTIFACT_PREFIX".to_string(), artifact_prefix.clone()),
            (
                "MODEL_CREDENTIAL_REF".to_string(),
                self.config.credential_ref.clone(),
            ),
        ];
        env.push((
            "PROMPT_FILE".to_string(),
            prompt_path.to_string_lossy().into_owned(),
        ));

        let launch = self.launch_spec(env, &spec.workspace_dir)?;
        let handle = self.launcher.launch(launch).await?;

        let deadline = tokio::time::Instant::now() + spec.timeout;
        let poll = Duration::from_secs(self.config.status_poll_secs.max(1));
        let exit_code = loop {
            spec.cancel.ensure_active("agent task")?;
            if tokio::time::Instant::now() >= deadline {
                self.launcher.stop(&handle).await?;
                return Err(ApiaryError::Timeout(format!("agent {}", spec.agent_id)));
            }
            match self.launcher.status(&handle).await? {
                LaunchStatus::Exited(code) => break code,
                LaunchStatus::Running => tokio::time::sleep(poll).await,
            }
        };
        self.read_outcome(&artifact_prefix, exit_code).await
    }
}
