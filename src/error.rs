use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy carried on every terminal job record.
///
/// Clients use this to distinguish "fix your input" (`Validation`) from
/// "retry later" (`TransientBackend`) without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Handler,
    Timeout,
    TransientBackend,
    PermanentBackend,
    Security,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::TransientBackend => "transient_backend",
            Self::PermanentBackend => "permanent_backend",
            Self::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(Self::Validation),
            "not_found" => Some(Self::NotFound),
            "conflict" => Some(Self::Conflict),
            "handler" => Some(Self::Handler),
            "timeout" => Some(Self::Timeout),
            "transient_backend" => Some(Self::TransientBackend),
            "permanent_backend" => Some(Self::PermanentBackend),
            "security" => Some(Self::Security),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ApiaryError {
    #[error("Invalid {what}: {reason}")]
    InvalidIdentifier { what: String, reason: String },

    #[error("Invalid payload for job type '{job_type}': {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("Workflow validation failed: {0}")]
    WorkflowValidation(String),

    #[error("Edge condition parse error: {0}")]
    ConditionParse(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Unknown tenant credential")]
    UnknownCredential,

    #[error("State conflict for job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: String,
        expected: String,
        actual: String,
    },

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Claim blocked by active chains: {0}")]
    ClaimBlocked(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Backend unavailable: {0}")]
    TransientBackend(String),

    #[error("Backend corrupted: {0}")]
    PermanentBackend(String),

    #[error("Unvalidated identifier reached a sensitive boundary: {0}")]
    Security(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ApiaryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIdentifier { .. }
            | Self::InvalidPayload { .. }
            | Self::WorkflowValidation(_)
            | Self::ConditionParse(_)
            | Self::UnknownJobType(_)
            | Self::Config(_)
            | Self::Toml(_) => ErrorKind::Validation,
            Self::JobNotFound(_)
            | Self::WorkflowNotFound(_)
            | Self::RunNotFound(_)
            | Self::UnknownCredential => ErrorKind::NotFound,
            Self::StateConflict { .. } | Self::Duplicate(_) | Self::ClaimBlocked(_) => {
                ErrorKind::Conflict
            }
            Self::Handler(_) | Self::Cancelled(_) | Self::Json(_) | Self::Other(_) => {
                ErrorKind::Handler
            }
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::TransientBackend(_) | Self::Io(_) => ErrorKind::TransientBackend,
            Self::PermanentBackend(_) => ErrorKind::PermanentBackend,
            Self::Security(_) => ErrorKind::Security,
        }
    }

    /// Transient errors are retried with backoff; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientBackend
    }

    /// Classify a SQLite failure: lock contention is retryable, anything
    /// else (corruption, schema mismatch) is permanent.
    pub fn storage(context: &str, e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::DatabaseBusy
                    || inner.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Self::TransientBackend(format!("{}: {}", context, e))
            }
            _ => Self::PermanentBackend(format!("{}: {}", context, e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiaryError>;
