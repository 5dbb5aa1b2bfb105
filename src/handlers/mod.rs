//! Registered job handlers and their payload schemas.
//!
//! Payload validation runs at dispatch entry, not inside the handler: each
//! handler deserializes its own tagged payload struct, so a malformed job is
//! rejected before any side effect.

mod chat;
mod echo;
pub mod workflow;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{ApiaryError, Result};
use crate::exec::{ExecOutcome, JobContext};

pub use chat::AgentChatHandler;
pub use echo::EchoHandler;
pub use workflow::WorkflowHandler;

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    /// Check payload shape without side effects. Called at submit time.
    fn validate(&self, payload: &Value) -> Result<()>;

    /// Handlers must be idempotent by job id: running twice with the same
    /// `(job_id, payload)` yields the same structured result.
    async fn run(&self, ctx: &JobContext, payload: Value) -> Result<ExecOutcome>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type().to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Reject unknown types and malformed payloads before a record is written.
    pub fn validate_payload(&self, job_type: &str, payload: &Value) -> Result<()> {
        let handler = self
            .get(job_type)
            .ok_or_else(|| ApiaryError::UnknownJobType(job_type.to_string()))?;
        handler.validate(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_lookup_and_listing() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler::new()));
        assert!(registry.contains("echo"));
        assert!(!registry.contains("nope"));
        assert_eq!(registry.job_types(), vec!["echo"]);
    }

    #[test]
    fn test_unknown_type_rejected_at_validation() {
        let registry = HandlerRegistry::new();
        let err = registry
            .validate_payload("mystery", &json!({}))
            .unwrap_err();
        assert!(matches!(err, ApiaryError::UnknownJobType(_)));
    }
}
