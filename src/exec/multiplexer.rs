//! Multiplexer strategy: runs interactive-agent CLIs inside a long-lived
//! tmux session keyed by tenant. Each job gets its own window; the agent
//! reads a machine-readable prompt file on startup and writes a result file
//! when done. The strategy watches the window for liveness.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentSpec, ExecOutcome, ExecutorStrategy, JobContext};
use crate::config::MultiplexerConfig;
use crate::error::{ApiaryError, Result};
use crate::ident::{self, IdentKind};
use crate::store::Job;

pub struct MultiplexerStrategy {
    config: MultiplexerConfig,
}

impl MultiplexerStrategy {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self { config }
    }

    fn session_name(&self, tenant_id: &str) -> Result<String> {
        ident::ensure_validated(tenant_id, IdentKind::Tenant)?;
        Ok(format!("{}-{}", self.config.session_prefix, tenant_id))
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| ApiaryError::TransientBackend(format!("tmux unavailable: {}", e)))
    }

    async fn ensure_session(&self, session: &str) -> Result<()> {
        let probe = self.tmux(&["has-session", "-t", session]).await?;
        if probe.status.success() {
            return Ok(());
        }
        let created = self.tmux(&["new-session", "-d", "-s", session]).await?;
        if !created.status.success() {
            // A concurrent worker may have created it between the probe and
            // the create; only fail if it still does not exist.
            let recheck = self.tmux(&["has-session", "-t", session]).await?;
            if !recheck.status.success() {
                return Err(ApiaryError::TransientBackend(format!(
                    "could not create tmux session {}: {}",
                    session,
                    String::from_utf8_lossy(&created.stderr).trim()
                )));
            }
        }
        debug!(session = session, "Multiplexer session ready");
        Ok(())
    }

    async fn window_alive(&self, session: &str, window: &str) -> Result<bool> {
        let output = self
            .tmux(&["list-windows", "-t", session, "-F", "#{window_name}"])
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|name| name.trim() == window))
    }

    async fn kill_window(&self, session: &str, window: &str) {
        let target = format!("{}:{}", session, window);
        if let Err(e) = self.tmux(&["kill-window", "-t", &target]).await {
            warn!(target = %target, error = %e, "Failed to kill window");
        }
    }

    /// Spawn a pane running the agent command and wait for its result file.
    ///
    /// The command line is assembled exclusively from validated identifiers
    /// and workspace-derived paths; prompt content travels through the
    /// prompt file, never argv.
    async fn run_window(
        &self,
        session: &str,
        window: &str,
        workspace_dir: &Path,
        prompt: &Value,
        timeout: Duration,
        cancel: &super::CancelToken,
    ) -> Result<ExecOutcome> {
        ident::ensure_validated(window, IdentKind::Run)?;
        self.ensure_session(session).await?;

        tokio::fs::create_dir_all(workspace_dir).await?;
        let prompt_path = workspace_dir.join(format!("prompt-{}.json", window));
        let result_path = workspace_dir.join(format!("result-{}.json", window));
        tokio::fs::write(&prompt_path, serde_json::to_vec_pretty(prompt)?).await?;
        // A stale result from a redelivered job would read as instant
        // completion; remove it before the pane starts.
        let _ = tokio::fs::remove_file(&result_path).await;

        let command_line = format!(
            "{} --prompt-file {} --result-file {}",
            self.config.agent_command,
            shell_path(&prompt_path),
            shell_path(&result_path),
        );
        let spawned = self
            .tmux(&[
                "new-window",
                "-d",
                "-t",
                session,
                "-n",
                window,
                &command_line,
            ])
            .await?;
        if !spawned.status.success() {
            return Err(ApiaryError::Handler(format!(
                "failed to spawn agent window: {}",
                String::from_utf8_lossy(&spawned.stderr).trim()
            )));
        }
        debug!(session = session, window = window, "Agent window spawned");

        let poll = Duration::from_secs(self.config.pane_poll_secs.max(1));
        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                self.kill_window(session, window).await;
                return Err(ApiaryError::Cancelled(format!("window {}", window)));
            }
            if started.elapsed() >= timeout {
                self.kill_window(session, window).await;
                return Err(ApiaryError::Timeout(format!(
                    "agent window {} produced no result within {}s",
                    window,
                    timeout.as_secs()
                )));
            }

            if tokio::fs::try_exists(&result_path).await.unwrap_or(false) {
                let bytes = tokio::fs::read(&result_path).await?;
                self.kill_window(session, window).await;
                let outcome: ExecOutcome = serde_json::from_slice(&bytes)
                    .or_else(|_| {
                        serde_json::from_slice::<Value>(&bytes).map(ExecOutcome::from_json)
                    })
                    .map_err(|e| ApiaryError::Handler(format!("unreadable result file: {}", e)))?;
                return Ok(outcome);
            }

            if !self.window_alive(session, window).await? {
                return Err(ApiaryError::Handler(format!(
                    "agent window {} exited without writing a result",
                    window
                )));
            }

            tokio::time::sleep(poll).await;
        }
    }
}

fn shell_path(path: &Path) -> String {
    // Workspace paths are built from validated segments; quoting guards the
    // data_dir root the operator chose.
    format!("'{}'", path.to_string_lossy().replace('\'', ""))
}

#[async_trait]
impl ExecutorStrategy for MultiplexerStrategy {
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Result<ExecOutcome> {
        let session = self.session_name(&job.tenant_id)?;
        let prompt = serde_json::json!({
            "job_id": job.id,
            "job_type": job.job_type,
            "payload": job.payload,
            "artifact_prefix": ctx.artifact_prefix,
        });
        let timeout = ctx.remaining().min(Duration::from_secs(
            self.config.result_timeout_secs,
        ));
        self.run_window(
            &session,
            &job.id,
            &ctx.workspace_dir,
            &prompt,
            timeout,
            &ctx.cancel,
        )
        .await
    }

    async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome> {
        ident::ensure_validated(&spec.agent_id, IdentKind::Agent)?;
        // Agents of one run share the run's session namespace.
        let session = format!("{}-{}", self.config.session_prefix, spec.run_id);
        ident::ensure_validated(&spec.run_id, IdentKind::Run)?;
        let prompt = serde_json::json!({
            "agent_id": spec.agent_id,
            "agent_type": spec.agent_type,
            "run_id": spec.run_id,
            "node_id": spec.node_id,
            "prompt": spec.prompt,
        });
        self.run_window(
            &session,
            &spec.agent_id,
            &spec.workspace_dir,
            &prompt,
            spec.timeout,
            &spec.cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_is_tenant_scoped() {
        let strategy = MultiplexerStrategy::new(MultiplexerConfig::default());
        assert_eq!(strategy.session_name("acme").unwrap(), "apiary-acme");
        assert!(strategy.session_name("bad tenant").is_err());
    }

    #[test]
    fn test_shell_path_strips_quotes() {
        assert_eq!(shell_path(Path::new("/a/b c")), "'/a/b c'");
        assert_eq!(shell_path(Path::new("/a/'x'")), "'/a/x'");
    }
}
