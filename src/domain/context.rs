//! Orchestration context.
//!
//! One context is built per inbound request and handed, by value, to a
//! single pipeline run. Building a context never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::clock::{Clock, SystemClock};

/// Immutable per-request envelope consumed by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationContext {
    operation_type: String,
    correlation_id: String,
    idempotency_key: Option<String>,
    initiated_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl OrchestrationContext {
    /// Start building a context for an operation type
    pub fn builder(operation_type: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(operation_type)
    }

    /// Business action identifier (e.g. `token.deploy.arc200`)
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    /// Tracing identifier, echoed on every result
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Caller-supplied deduplication key, if any
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Identity of the initiator, if known
    pub fn initiated_by(&self) -> Option<&str> {
        self.initiated_by.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Build a context from optional inbound metadata.
///
/// A missing or blank correlation id is replaced by a fresh UUIDv4. A blank
/// idempotency key or initiator is treated as absent.
pub fn build_context(
    operation_type: impl Into<String>,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    initiated_by: Option<String>,
) -> OrchestrationContext {
    let mut builder = OrchestrationContext::builder(operation_type);
    if let Some(id) = correlation_id {
        builder = builder.correlation_id(id);
    }
    if let Some(key) = idempotency_key {
        builder = builder.idempotency_key(key);
    }
    if let Some(who) = initiated_by {
        builder = builder.initiated_by(who);
    }
    builder.build()
}

/// Builder for [`OrchestrationContext`]
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    operation_type: String,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    initiated_by: Option<String>,
}

impl ContextBuilder {
    fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            correlation_id: None,
            idempotency_key: None,
            initiated_by: None,
        }
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = non_blank(correlation_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = non_blank(key.into());
        self
    }

    pub fn initiated_by(mut self, initiator: impl Into<String>) -> Self {
        self.initiated_by = non_blank(initiator.into());
        self
    }

    /// Finish the context, stamping it with the system clock
    pub fn build(self) -> OrchestrationContext {
        self.build_with_clock(&SystemClock)
    }

    /// Finish the context, stamping it with the given clock
    pub fn build_with_clock(self, clock: &dyn Clock) -> OrchestrationContext {
        OrchestrationContext {
            operation_type: self.operation_type,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            idempotency_key: self.idempotency_key,
            initiated_by: self.initiated_by,
            created_at: clock.now(),
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
