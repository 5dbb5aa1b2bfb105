//! Task-launch primitive. The trait mirrors the container-task API surface
//! the cloud deployment uses (launch with env + command override, poll to
//! termination); the local implementation runs the task as a child process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ApiaryError, Result};

/// Everything needed to start one worker task. All identifier-shaped fields
/// must already be validated; the launcher asserts rather than re-validates.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_definition: String,
    pub container_name: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    Running,
    Exited(i32),
}

#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
}

#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskHandle>;
    async fn status(&self, handle: &TaskHandle) -> Result<LaunchStatus>;
    async fn stop(&self, handle: &TaskHandle) -> Result<()>;
}

/// Runs launch specs as local child processes. Stand-in for the cloud task
/// API with identical observable behavior: detached start, polled status,
/// exit code reporting.
pub struct ProcessLauncher {
    children: Arc<Mutex<HashMap<String, Child>>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskHandle> {
        let program = spec
            .command
            .first()
            .ok_or_else(|| ApiaryError::Config("launch spec has an empty command".into()))?;

        let mut command = Command::new(program);
        command
            .args(&spec.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in &spec.env {
            command.env(name, value);
        }
        if let Some(dir) = &spec.working_dir {
            std::fs::create_dir_all(dir)?;
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| ApiaryError::Handler(format!("failed to spawn {}: {}", program, e)))?;

        let task_id = Uuid::new_v4().to_string();
        debug!(
            task_id = %task_id,
            task_definition = %spec.task_definition,
            program = %program,
            "Task launched"
        );
        self.children.lock().insert(task_id.clone(), child);
        Ok(TaskHandle { task_id })
    }

    async fn status(&self, handle: &TaskHandle) -> Result<LaunchStatus> {
        let mut children = self.children.lock();
        let child = children
            .get_mut(&handle.task_id)
            .ok_or_else(|| ApiaryError::JobNotFound(handle.task_id.clone()))?;

        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                children.remove(&handle.task_id);
                Ok(LaunchStatus::Exited(code))
            }
            Ok(None) => Ok(LaunchStatus::Running),
            Err(e) => Err(ApiaryError::Handler(format!("task status: {}", e))),
        }
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&handle.task_id) {
            if let Err(e) = child.start_kill() {
                warn!(task_id = %handle.task_id, error = %e, "Kill failed");
            }
            children.remove(&handle.task_id);
        }
        Ok(())
    }
}
