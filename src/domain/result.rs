//! Pipeline results, failure taxonomy and audit summaries.
//!
//! Every pipeline run produces exactly one [`OrchestrationResult`], which
//! always carries an [`AuditSummary`]. Failures are typed values, never
//! panics or raw error chains.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::context::OrchestrationContext;

/// Stable machine-readable error codes
pub mod codes {
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const PRECONDITION_FAILED: &str = "PRECONDITION_FAILED";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
    pub const IDEMPOTENCY_CONFLICT: &str = "IDEMPOTENCY_CONFLICT";
    pub const IDEMPOTENCY_KEY_REQUIRED: &str = "IDEMPOTENCY_KEY_REQUIRED";
    pub const REQUEST_IN_PROGRESS: &str = "REQUEST_IN_PROGRESS";
    pub const REQUEST_NOT_FINGERPRINTABLE: &str = "REQUEST_NOT_FINGERPRINTABLE";
    pub const IDEMPOTENCY_STORE_UNAVAILABLE: &str = "IDEMPOTENCY_STORE_UNAVAILABLE";
    pub const RESULT_NOT_SERIALIZABLE: &str = "RESULT_NOT_SERIALIZABLE";
    pub const REPLAY_DECODE_FAILED: &str = "REPLAY_DECODE_FAILED";
}

/// Category of a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Request shape rejected; not retryable as-is
    ValidationFailure,

    /// Business state prevents the operation (e.g. duplicate resource)
    PreconditionFailure,

    /// The executor or a dependency failed
    ExecutionFailure,

    /// The idempotency key was reused for a different request
    IdempotencyConflict,

    /// A duplicate submission is still executing; retry later with the same key
    RequestInProgress,
}

impl FailureCategory {
    /// Code used when a stage does not supply its own
    pub fn default_code(&self) -> &'static str {
        match self {
            Self::ValidationFailure => codes::VALIDATION_FAILED,
            Self::PreconditionFailure => codes::PRECONDITION_FAILED,
            Self::ExecutionFailure => codes::EXECUTION_FAILED,
            Self::IdempotencyConflict => codes::IDEMPOTENCY_CONFLICT,
            Self::RequestInProgress => codes::REQUEST_IN_PROGRESS,
        }
    }

    /// HTTP status a front-end should surface for this category
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationFailure => 400,
            Self::PreconditionFailure => 409,
            Self::IdempotencyConflict => 422,
            Self::RequestInProgress => 425,
            Self::ExecutionFailure => 502,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailure => "validation_failure",
            Self::PreconditionFailure => "precondition_failure",
            Self::ExecutionFailure => "execution_failure",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::RequestInProgress => "request_in_progress",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage's refusal to proceed.
///
/// Validators and precondition checkers return this; executors may return it
/// through `anyhow` to keep a specific code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Rejection {
    /// Machine-readable code; the category default applies when absent
    pub code: Option<String>,

    /// Human-readable explanation
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// A categorized failure with a stable code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(
        category: FailureCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Failure from a rejection, falling back to the category's default code
    pub fn from_rejection(category: FailureCategory, rejection: Rejection) -> Self {
        let code = rejection
            .code
            .unwrap_or_else(|| category.default_code().to_string());
        Self::new(category, code, rejection.message)
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Structured record of what a pipeline run did.
///
/// Built once per run and read-only afterwards. Persisting it is left to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub correlation_id: String,
    pub operation_type: String,
    pub initiated_by: Option<String>,
    pub outcome: Outcome,
    pub failure_code: Option<String>,

    /// Number of pipeline stages reached (0-3)
    pub stages_completed: u8,

    pub has_idempotency_key: bool,

    /// Served from the idempotency cache
    pub replayed: bool,

    /// Executor invocations made by this call (0 or 1)
    pub executor_invocations: u32,

    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Bookkeeping a run hands over when its result is assembled
#[derive(Debug, Clone, Copy)]
pub struct RunStats {
    pub stages_completed: u8,
    pub executor_invocations: u32,
    pub replayed: bool,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Result of one pipeline run.
///
/// Exactly one of payload and failure is present; the type makes any other
/// combination unrepresentable.
#[derive(Debug, Clone)]
pub struct OrchestrationResult<T> {
    outcome: Result<T, Failure>,
    correlation_id: String,
    idempotency_key: Option<String>,
    replayed: bool,
    audit: AuditSummary,
}

impl<T> OrchestrationResult<T> {
    /// Assemble a result and its audit summary for a context
    pub fn new(context: &OrchestrationContext, outcome: Result<T, Failure>, stats: RunStats) -> Self {
        let audit = AuditSummary {
            correlation_id: context.correlation_id().to_string(),
            operation_type: context.operation_type().to_string(),
            initiated_by: context.initiated_by().map(str::to_string),
            outcome: if outcome.is_ok() {
                Outcome::Succeeded
            } else {
                Outcome::Failed
            },
            failure_code: outcome.as_ref().err().map(|f| f.code.clone()),
            stages_completed: stats.stages_completed,
            has_idempotency_key: context.idempotency_key().is_some(),
            replayed: stats.replayed,
            executor_invocations: stats.executor_invocations,
            duration_ms: stats.duration_ms,
            completed_at: stats.completed_at,
        };

        Self {
            outcome,
            correlation_id: context.correlation_id().to_string(),
            idempotency_key: context.idempotency_key().map(str::to_string),
            replayed: stats.replayed,
            audit,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn into_payload(self) -> Option<T> {
        self.outcome.ok()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.outcome.as_ref().err()
    }

    pub fn error_code(&self) -> Option<&str> {
        self.failure().map(|f| f.code.as_str())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.failure().map(|f| f.message.as_str())
    }

    pub fn failure_category(&self) -> Option<FailureCategory> {
        self.failure().map(|f| f.category)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Whether this result was replayed from the idempotency cache
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub fn audit(&self) -> &AuditSummary {
        &self.audit
    }

    /// Borrow the outcome as a plain `Result`
    pub fn as_result(&self) -> Result<&T, &Failure> {
        self.outcome.as_ref()
    }

    /// HTTP status for the response derived from this result
    pub fn http_status(&self) -> u16 {
        self.failure_category().map_or(200, |c| c.http_status())
    }
}

impl<T: PartialEq> OrchestrationResult<T> {
    /// Compare business outcomes, ignoring tracing and audit metadata
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.outcome == other.outcome
    }
}

impl<T: Clone> OrchestrationResult<T> {
    /// Response body a front-end returns for this result
    pub fn to_envelope(&self) -> ResponseEnvelope<T> {
        let failure = self.failure();
        ResponseEnvelope {
            success: self.is_success(),
            data: self.payload().cloned(),
            error_code: failure.map(|f| f.code.clone()),
            message: failure.map(|f| f.message.clone()),
            failure_category: failure.map(|f| f.category),
            correlation_id: self.correlation_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            replayed: self.replayed,
            http_status: self.http_status(),
        }
    }
}

/// Wire shape of a pipeline response.
///
/// Always carries the correlation id; `replayed` distinguishes cache hits
/// from fresh executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub replayed: bool,
    pub http_status: u16,
}
