//! Pluggable text-completion provider interface.
//!
//! The orchestrator core never talks to a model API directly; handlers and
//! node executors go through this trait so deployments can wire any client
//! behind it. A scripted implementation ships for tests and dry runs.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ApiaryError, Result};

pub const DEFAULT_MODEL: &str = "worker-default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            max_tokens: None,
            system: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub model: String,
}

#[async_trait]
pub trait TextProvider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<Completion>;
}

/// Returns pre-seeded responses in order, then echoes prompts back.
/// Used by tests and by local dry runs where no provider is configured.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_responses(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[async_trait]
impl TextProvider for ScriptedProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<Completion> {
        if request.prompt.is_empty() {
            return Err(ApiaryError::InvalidPayload {
                job_type: "generate".into(),
                reason: "prompt must not be empty".into(),
            });
        }
        let text = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("ack: {}", request.prompt));
        Ok(Completion {
            usage: Usage {
                input_tokens: estimate_tokens(&request.prompt),
                output_tokens: estimate_tokens(&text),
            },
            model: request.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            text,
        })
    }
}
