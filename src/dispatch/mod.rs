//! Dispatch engine: a pool of worker loops that lease messages, claim jobs
//! with a CAS transition, run the configured executor strategy, and record
//! terminal state. At-least-once delivery; handlers are idempotent by job id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BlobStore, JobQueue, QueueLease, with_backoff};
use crate::config::DispatchConfig;
use crate::error::{ApiaryError, ErrorKind, Result};
use crate::exec::{CancelToken, ExecOutcome, ExecutorStrategy, Heartbeat, JobContext};
use crate::handlers::HandlerRegistry;
use crate::store::{Job, JobState, JobStore, TransitionUpdate};
use crate::tenant::TenantScope;

#[derive(Debug, Serialize, Deserialize)]
struct QueuedMessage {
    job_id: String,
}

/// Extends the queue lease and refreshes the job record's `updated_at`.
struct LeaseHeartbeat {
    queue: Arc<dyn JobQueue>,
    store: Arc<JobStore>,
    lease: QueueLease,
    job_id: String,
    visibility: Duration,
}

#[async_trait]
impl Heartbeat for LeaseHeartbeat {
    async fn beat(&self) -> Result<()> {
        self.queue.extend(&self.lease, self.visibility).await?;
        self.store.touch(&self.job_id)
    }
}

pub struct Dispatcher {
    store: Arc<JobStore>,
    queue: Arc<dyn JobQueue>,
    blob: Arc<dyn BlobStore>,
    handlers: Arc<HandlerRegistry>,
    strategy: Arc<dyn ExecutorStrategy>,
    config: DispatchConfig,
    data_dir: std::path::PathBuf,
    shutdown: CancelToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<dyn JobQueue>,
        blob: Arc<dyn BlobStore>,
        handlers: Arc<HandlerRegistry>,
        strategy: Arc<dyn ExecutorStrategy>,
        config: DispatchConfig,
        data_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            store,
            queue,
            blob,
            handlers,
            strategy,
            config,
            data_dir: data_dir.into(),
            shutdown: CancelToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Write the QUEUED record, then enqueue. If the enqueue is lost the
    /// reconciler re-sends it once the record ages past the grace window.
    pub async fn submit(&self, tenant_id: &str, job_type: &str, payload: Value) -> Result<String> {
        self.handlers.validate_payload(job_type, &payload)?;

        let job_id = format!("j-{}", Uuid::new_v4().simple());
        let job = Job::new(&job_id, tenant_id, job_type, payload);

        let store = Arc::clone(&self.store);
        let to_insert = job.clone();
        with_backoff("job insert", move || {
            let store = Arc::clone(&store);
            let job = to_insert.clone();
            async move { store.insert(&job) }
        })
        .await?;

        let body = serde_json::to_string(&QueuedMessage {
            job_id: job_id.clone(),
        })?;
        let queue = Arc::clone(&self.queue);
        let enqueue = with_backoff("job enqueue", move || {
            let queue = Arc::clone(&queue);
            let body = body.clone();
            async move { queue.send(&body).await }
        })
        .await;
        if let Err(e) = enqueue {
            warn!(job_id = %job_id, error = %e, "Enqueue failed; reconciler will resend");
        }

        info!(job_id = %job_id, job_type = job_type, tenant = tenant_id, "Job submitted");
        Ok(job_id)
    }

    /// Run the worker pool plus the reconciler until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        for index in 0..self.config.worker_count {
            let dispatcher = Arc::clone(&self);
            tasks.spawn(async move {
                dispatcher.worker_loop(index).await;
            });
        }
        let reconciler = Arc::clone(&self);
        tasks.spawn(async move {
            reconciler.reconcile_loop().await;
        });
        while tasks.join_next().await.is_some() {}
    }

    async fn worker_loop(&self, index: usize) {
        let worker_id = format!("worker-{}-{}", std::process::id(), index);
        info!(worker = %worker_id, "Dispatch worker started");
        while !self.shutdown.is_cancelled() {
            match self.run_once(&worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(Duration::from_secs(self.config.queue_poll_secs)).await;
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Dispatch iteration failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker = %worker_id, "Dispatch worker stopped");
    }

    /// Receive and process at most one message. Returns false when the
    /// queue was empty. Public so tests can drive the loop deterministically.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        let visibility = Duration::from_secs(self.config.visibility_timeout_secs);
        let queue = Arc::clone(&self.queue);
        let lease = with_backoff("queue receive", move || {
            let queue = Arc::clone(&queue);
            async move { queue.receive(visibility).await }
        })
        .await?;

        let Some(lease) = lease else {
            return Ok(false);
        };

        let message: QueuedMessage = match serde_json::from_str(&lease.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(body = %lease.body, error = %e, "Dropping malformed message");
                self.queue.delete(&lease).await?;
                return Ok(true);
            }
        };

        self.handle_message(worker_id, lease, &message.job_id).await?;
        Ok(true)
    }

    async fn handle_message(
        &self,
        worker_id: &str,
        lease: QueueLease,
        job_id: &str,
    ) -> Result<()> {
        let Some(job) = self.store.get_unscoped(job_id)? else {
            warn!(job_id = job_id, "Message references missing job; dropping");
            self.queue.delete(&lease).await?;
            return Ok(());
        };

        // Claim the job. Losing the CAS means another delivery won (or the
        // job is already terminal): delete the message and move on.
        let claim = self.store.transition(
            job_id,
            JobState::Queued,
            TransitionUpdate::to(JobState::Running).with_worker(worker_id),
        );
        let job = match claim {
            Ok(job) => job,
            Err(ApiaryError::StateConflict { actual, .. }) => {
                debug!(job_id = job_id, state = %actual, "CAS miss; dropping duplicate delivery");
                self.queue.delete(&lease).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.handlers.contains(&job.job_type) {
            self.finish_failed(
                job_id,
                ErrorKind::Validation,
                format!("job type '{}' is not registered", job.job_type),
            )
            .await?;
            self.queue.delete(&lease).await?;
            return Ok(());
        }

        let outcome = self.execute_job(worker_id, &job, &lease).await;
        match outcome {
            Ok(outcome) => {
                let pointer = self.upload_result(&job, &outcome).await?;
                self.finish_succeeded(job_id, pointer).await?;
                self.queue.delete(&lease).await?;
            }
            Err(e) if e.is_transient() => {
                // No terminal write: return the lease and let the message
                // reappear after the visibility timeout.
                warn!(job_id = job_id, error = %e, "Transient backend failure; lease returned");
            }
            Err(e) => {
                self.finish_failed(job_id, e.kind(), e.to_string()).await?;
                self.queue.delete(&lease).await?;
            }
        }
        Ok(())
    }

    async fn execute_job(
        &self,
        worker_id: &str,
        job: &Job,
        lease: &QueueLease,
    ) -> Result<ExecOutcome> {
        let tenant = TenantScope::new(&self.data_dir, &job.tenant_id)?;
        let workspace_dir = tenant.workspace_dir(&job.id)?;
        tokio::fs::create_dir_all(&workspace_dir).await?;

        let deadline_secs = self.config.job_deadline_secs;
        let ctx = JobContext {
            job_id: job.id.clone(),
            worker_id: worker_id.to_string(),
            artifact_prefix: tenant.artifact_prefix(&job.id)?,
            workspace_dir,
            tenant,
            blob: Arc::clone(&self.blob),
            cancel: self.shutdown.clone(),
            deadline: Utc::now() + chrono::Duration::seconds(deadline_secs as i64),
            heartbeat: Arc::new(LeaseHeartbeat {
                queue: Arc::clone(&self.queue),
                store: Arc::clone(&self.store),
                lease: lease.clone(),
                job_id: job.id.clone(),
                visibility: Duration::from_secs(self.config.visibility_timeout_secs),
            }),
        };

        let hard_deadline =
            Duration::from_secs(deadline_secs + self.config.cancel_grace_secs);
        match tokio::time::timeout(hard_deadline, self.strategy.execute(&ctx, job)).await {
            Ok(result) => result,
            Err(_) => Err(ApiaryError::Timeout(format!(
                "job {} exceeded {}s deadline",
                job.id, deadline_secs
            ))),
        }
    }

    async fn upload_result(&self, job: &Job, outcome: &ExecOutcome) -> Result<String> {
        let tenant = TenantScope::new(&self.data_dir, &job.tenant_id)?;
        let key = format!("{}/result.json", tenant.artifact_prefix(&job.id)?);
        let bytes = serde_json::to_vec_pretty(outcome)?;
        let blob = Arc::clone(&self.blob);
        let upload_key = key.clone();
        with_backoff("result upload", move || {
            let blob = Arc::clone(&blob);
            let key = upload_key.clone();
            let bytes = bytes.clone();
            async move { blob.put(&key, &bytes).await }
        })
        .await?;
        Ok(key)
    }

    async fn finish_succeeded(&self, job_id: &str, pointer: String) -> Result<()> {
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_string();
        with_backoff("terminal write", move || {
            let store = Arc::clone(&store);
            let job_id = job_id.clone();
            let pointer = pointer.clone();
            async move {
                store
                    .transition(
                        &job_id,
                        JobState::Running,
                        TransitionUpdate::to(JobState::Succeeded).with_result_pointer(pointer),
                    )
                    .map(|_| ())
            }
        })
        .await
    }

    async fn finish_failed(&self, job_id: &str, kind: ErrorKind, message: String) -> Result<()> {
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_string();
        with_backoff("terminal write", move || {
            let store = Arc::clone(&store);
            let job_id = job_id.clone();
            let message = message.clone();
            async move {
                store
                    .transition(
                        &job_id,
                        JobState::Running,
                        TransitionUpdate::to(JobState::Failed).with_error(kind, message),
                    )
                    .map(|_| ())
            }
        })
        .await
    }

    async fn reconcile_loop(&self) {
        let interval = Duration::from_secs(self.config.reconcile_interval_secs);
        while !self.shutdown.is_cancelled() {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "Reconcile pass failed");
            }
        }
    }

    /// Re-enqueue QUEUED records older than the grace window. Duplicate
    /// messages are harmless: the CAS claim admits exactly one winner.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let grace = Duration::from_secs(self.config.reconcile_grace_secs);
        let stuck = self.store.stuck_queued(grace)?;
        let count = stuck.len();
        for job_id in stuck {
            let body = serde_json::to_string(&QueuedMessage {
                job_id: job_id.clone(),
            })?;
            self.queue.send(&body).await?;
            debug!(job_id = %job_id, "Re-enqueued stuck job");
        }
        Ok(count)
    }
}
