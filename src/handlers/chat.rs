//! Agent invocation handler: ships a prompt to the configured text provider
//! and returns the completion with usage accounting.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobHandler;
use crate::error::{ApiaryError, Result};
use crate::exec::{ExecOutcome, JobContext};
use crate::provider::{GenerateRequest, TextProvider, Usage};

#[derive(Debug, Deserialize)]
struct ChatPayload {
    prompt: String,
    model: Option<String>,
    max_tokens: Option<u32>,
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResult {
    response_text: String,
    usage: Usage,
    model: String,
}

pub struct AgentChatHandler {
    job_type: String,
    provider: Arc<dyn TextProvider>,
}

impl AgentChatHandler {
    pub fn new(provider: Arc<dyn TextProvider>) -> Self {
        Self::named("agent_chat", provider)
    }

    /// Additional registrations ("analytics", ...) share the implementation
    /// and differ only in registered type name.
    pub fn named(job_type: impl Into<String>, provider: Arc<dyn TextProvider>) -> Self {
        Self {
            job_type: job_type.into(),
            provider,
        }
    }

    fn parse(&self, payload: Value) -> Result<ChatPayload> {
        let payload: ChatPayload =
            serde_json::from_value(payload).map_err(|e| ApiaryError::InvalidPayload {
                job_type: self.job_type.clone(),
                reason: e.to_string(),
            })?;
        if payload.prompt.trim().is_empty() {
            return Err(ApiaryError::InvalidPayload {
                job_type: self.job_type.clone(),
                reason: "prompt must not be empty".into(),
            });
        }
        Ok(payload)
    }
}

#[async_trait]
impl JobHandler for AgentChatHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn validate(&self, payload: &Value) -> Result<()> {
        self.parse(payload.clone()).map(|_| ())
    }

    async fn run(&self, ctx: &JobContext, payload: Value) -> Result<ExecOutcome> {
        let payload = self.parse(payload)?;
        ctx.cancel.ensure_active(&self.job_type)?;

        let mut request = GenerateRequest::new(payload.prompt);
        request.model = payload.model;
        request.max_tokens = payload.max_tokens;
        request.system = payload.system;

        let completion = self.provider.generate(request).await?;
        let result = ChatResult {
            response_text: completion.text,
            usage: completion.usage,
            model: completion.model,
        };
        Ok(ExecOutcome::from_json(serde_json::to_value(result)?))
    }
}
