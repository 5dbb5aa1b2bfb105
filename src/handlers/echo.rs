//! Echo handler: the smallest possible job, used for round-trip checks.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobHandler;
use crate::error::{ApiaryError, Result};
use crate::exec::{ExecOutcome, JobContext};

#[derive(Debug, Deserialize)]
struct EchoPayload {
    message: String,
}

#[derive(Debug, Serialize)]
struct EchoResult {
    echoed: String,
    processed_by: String,
    processed_at: String,
}

pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for EchoHandler {
    fn job_type(&self) -> &str {
        "echo"
    }

    fn validate(&self, payload: &Value) -> Result<()> {
        serde_json::from_value::<EchoPayload>(payload.clone()).map_err(|e| {
            ApiaryError::InvalidPayload {
                job_type: "echo".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn run(&self, ctx: &JobContext, payload: Value) -> Result<ExecOutcome> {
        let payload: EchoPayload =
            serde_json::from_value(payload).map_err(|e| ApiaryError::InvalidPayload {
                job_type: "echo".into(),
                reason: e.to_string(),
            })?;
        ctx.cancel.ensure_active("echo")?;

        let result = EchoResult {
            echoed: payload.message,
            processed_by: ctx.worker_id.clone(),
            processed_at: Utc::now().to_rfc3339(),
        };
        Ok(ExecOutcome::from_json(serde_json::to_value(result)?))
    }
}
