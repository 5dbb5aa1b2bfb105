//! In-process strategy: jobs run as registered handler functions, agents run
//! as direct provider calls. The default for single-node deployments and the
//! only strategy tests need.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{AgentSpec, ExecOutcome, ExecutorStrategy, JobContext};
use crate::error::{ApiaryError, Result};
use crate::handlers::HandlerRegistry;
use crate::provider::{GenerateRequest, TextProvider};
use crate::store::Job;

pub struct InProcessStrategy {
    handlers: Arc<HandlerRegistry>,
    provider: Arc<dyn TextProvider>,
}

impl InProcessStrategy {
    pub fn new(handlers: Arc<HandlerRegistry>, provider: Arc<dyn TextProvider>) -> Self {
        Self { handlers, provider }
    }
}

#[async_trait]
impl ExecutorStrategy for InProcessStrategy {
    async fn execute(&self, ctx: &JobContext, job: &Job) -> Result<ExecOutcome> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| ApiaryError::UnknownJobType(job.job_type.clone()))?;
        debug!(job_id = %job.id, job_type = %job.job_type, "Running in-process handler");
        handler.run(ctx, job.payload.clone()).await
    }

    async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome> {
        spec.cancel.ensure_active("spawn_agent")?;
        let completion = self
            .provider
            .generate(GenerateRequest::new(spec.prompt.clone()))
            .await?;
        debug!(
            agent_id = %spec.agent_id,
            node_id = %spec.node_id,
            output_tokens = completion.usage.output_tokens,
            "Agent completed"
        );
        Ok(ExecOutcome::from_text(completion.text))
    }
}
