//! Core orchestration logic.
//!
//! This module contains:
//! - Fingerprint: Stable hashes of (operation type, normalized request)
//! - Idempotency: Key -> outcome store with per-key atomic decisions
//! - Policy: Validation, precondition and executor stage traits
//! - Pipeline: The staged, idempotent executor
//! - Clock: Time source for timestamps, leases and retention

pub mod clock;
pub mod fingerprint;
pub mod idempotency;
pub mod pipeline;
pub mod policy;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{FingerprintError, RequestFingerprint};
pub use idempotency::{
    BeginOutcome, CachedOutcome, Claim, IdempotencyError, IdempotencyRecord, IdempotencyStore,
    InMemoryIdempotencyStore, RecordState, StoreStats,
};
pub use pipeline::OrchestrationPipeline;
pub use policy::{AcceptAll, Executor, PreconditionChecker, Validator};
