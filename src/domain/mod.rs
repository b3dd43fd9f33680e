//! Domain types for the orchestration core.
//!
//! This module contains:
//! - Context: the immutable per-request envelope
//! - Result: results, failure taxonomy, audit summaries, response envelopes
//! - Operation: well-known operation type identifiers

pub mod context;
pub mod operation;
pub mod result;

// Re-export commonly used types
pub use context::{build_context, ContextBuilder, OrchestrationContext};
pub use operation::OperationType;
pub use result::{
    codes, AuditSummary, Failure, FailureCategory, OrchestrationResult, Outcome, Rejection,
    ResponseEnvelope, RunStats,
};
