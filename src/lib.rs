//! tokenflow - Idempotent workflow orchestration for token issuance backends
//!
//! Wraps every state-mutating business operation (token deployment,
//! compliance metadata upsert, whitelist change) in a staged pipeline and
//! deduplicates retries and concurrent duplicates by idempotency key.
//!
//! # Architecture
//!
//! - Every run goes validate → check preconditions → execute
//! - Every run yields a typed result and an audit summary
//! - With an idempotency key, at most one submission executes; identical
//!   retries replay its outcome, different requests under the key conflict
//!
//! # Modules
//!
//! - `core`: Pipeline, idempotency store, fingerprints, stage policies
//! - `domain`: Context, results, failure taxonomy, audit summaries
//! - `config`: Layered settings (env, YAML file, defaults)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit the same deployment three times concurrently under one key
//! tokenflow simulate --key k1 --concurrency 3 '{"name":"X"}'
//!
//! # Fingerprint a payload
//! tokenflow fingerprint --operation token.deploy.arc200 '{"name":"X"}'
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{
    AcceptAll, Executor, IdempotencyStore, InMemoryIdempotencyStore, OrchestrationPipeline,
    PreconditionChecker, RequestFingerprint, Validator,
};
pub use domain::{
    build_context, AuditSummary, FailureCategory, OperationType, OrchestrationContext,
    OrchestrationResult, Rejection, ResponseEnvelope,
};
