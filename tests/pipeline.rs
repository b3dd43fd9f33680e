//! Pipeline Integration Tests
//!
//! Stage ordering, failure categorization, determinism and correlation ids.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokenflow::core::{AcceptAll, Executor, InMemoryIdempotencyStore, PreconditionChecker};
use tokenflow::domain::{codes, Outcome};
use tokenflow::{
    build_context, FailureCategory, OperationType, OrchestrationPipeline, OrchestrationResult,
    Rejection,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateAsset {
    name: String,
}

fn asset(name: &str) -> CreateAsset {
    CreateAsset {
        name: name.to_string(),
    }
}

/// Executor that records how often it ran
#[derive(Debug, Clone, Default)]
struct CountingExecutor {
    calls: Arc<AtomicUsize>,
}

impl CountingExecutor {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor<CreateAsset, String> for CountingExecutor {
    async fn execute(&self, request: CreateAsset) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("created-{}", request.name))
    }
}

/// Precondition backed by an async registry lookup
#[derive(Debug, Default)]
struct Registry {
    existing: tokio::sync::RwLock<Vec<String>>,
}

impl PreconditionChecker<CreateAsset> for Registry {
    async fn check(&self, request: &CreateAsset) -> Result<(), Rejection> {
        let existing = self.existing.read().await;
        if existing.contains(&request.name) {
            return Err(Rejection::with_code(
                "ASSET_EXISTS",
                format!("asset '{}' already exists", request.name),
            ));
        }
        Ok(())
    }
}

fn name_required(request: &CreateAsset) -> Result<(), Rejection> {
    if request.name.trim().is_empty() {
        return Err(Rejection::new("name required"));
    }
    Ok(())
}

fn pipeline() -> OrchestrationPipeline {
    OrchestrationPipeline::new(Arc::new(InMemoryIdempotencyStore::default()))
}

#[tokio::test]
async fn test_successful_run() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();
    let ctx = build_context(
        OperationType::DEPLOY_ARC200,
        None,
        Some("k1".to_string()),
        Some("issuer-admin".to_string()),
    );

    let result = pipeline
        .execute(ctx, asset("X"), &name_required, &AcceptAll, &executor)
        .await;

    assert!(result.is_success());
    assert_eq!(result.payload().map(String::as_str), Some("created-X"));
    assert_eq!(result.error_code(), None);
    assert!(!result.is_replay());

    let audit = result.audit();
    assert_eq!(audit.outcome, Outcome::Succeeded);
    assert_eq!(audit.stages_completed, 3);
    assert_eq!(audit.executor_invocations, 1);
    assert_eq!(audit.operation_type, OperationType::DEPLOY_ARC200);
    assert_eq!(audit.initiated_by.as_deref(), Some("issuer-admin"));
    assert!(audit.has_idempotency_key);
    assert_eq!(audit.failure_code, None);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_validation_failure_stops_pipeline() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();
    let registry = Registry::default();

    let result = pipeline
        .execute(
            build_context("op", None, Some("k-empty".to_string()), None),
            asset(""),
            &name_required,
            &registry,
            &executor,
        )
        .await;

    assert!(!result.is_success());
    assert_eq!(result.failure_category(), Some(FailureCategory::ValidationFailure));
    assert_eq!(result.error_code(), Some(codes::VALIDATION_FAILED));
    assert!(result.error_message().unwrap().contains("name required"));
    assert_eq!(result.audit().stages_completed, 1);
    assert_eq!(result.audit().outcome, Outcome::Failed);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_precondition_failure_stops_pipeline() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();
    let registry = Registry::default();
    registry.existing.write().await.push("X".to_string());

    let result = pipeline
        .execute(
            build_context("op", None, None, None),
            asset("X"),
            &name_required,
            &registry,
            &executor,
        )
        .await;

    assert_eq!(result.failure_category(), Some(FailureCategory::PreconditionFailure));
    assert_eq!(result.error_code(), Some("ASSET_EXISTS"));
    assert_eq!(result.audit().stages_completed, 2);
    assert_eq!(result.http_status(), 409);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_execution_failure() {
    let pipeline = pipeline();
    let executor = |_: CreateAsset| async {
        Err::<String, _>(anyhow::anyhow!("algod node unreachable"))
    };

    let result: OrchestrationResult<String> = pipeline
        .execute(
            build_context("op", None, None, None),
            asset("X"),
            &name_required,
            &AcceptAll,
            &executor,
        )
        .await;

    assert_eq!(result.failure_category(), Some(FailureCategory::ExecutionFailure));
    assert_eq!(result.error_code(), Some(codes::EXECUTION_FAILED));
    assert_eq!(result.error_message(), Some("algod node unreachable"));
    assert_eq!(result.audit().stages_completed, 3);
    assert_eq!(result.audit().executor_invocations, 1);

    let envelope = result.to_envelope();
    assert!(!envelope.success);
    assert_eq!(envelope.data, None);
    assert_eq!(envelope.http_status, 502);
}

#[tokio::test]
async fn test_outcome_is_deterministic() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();

    // Fresh executions: no key, then a key of its own for every submission
    let mut results = Vec::new();
    for slot in [None, Some("d1"), Some("d2")] {
        for request in [asset("X"), asset("")] {
            let key = slot.map(|slot| format!("{}-{}", slot, request.name));
            let ctx = build_context("op", None, key, None);
            results.push((
                request.name.clone(),
                pipeline
                    .execute(ctx, request, &name_required, &AcceptAll, &executor)
                    .await,
            ));
        }
    }

    let reference: Vec<_> = results.iter().take(2).collect();
    assert_eq!(executor.calls(), 3);
    for (name, result) in &results {
        assert!(!result.is_replay());
        let (_, expected) = reference.iter().find(|(n, _)| n == name).unwrap();
        assert!(result.same_outcome(expected));
        assert_eq!(result.failure_category(), expected.failure_category());
        assert_eq!(result.error_code(), expected.error_code());
        assert_eq!(result.audit().stages_completed, expected.audit().stages_completed);
    }
}

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();

    let supplied = pipeline
        .execute(
            build_context("op", Some("corr-42".to_string()), None, None),
            asset("X"),
            &name_required,
            &AcceptAll,
            &executor,
        )
        .await;
    assert_eq!(supplied.correlation_id(), "corr-42");
    assert_eq!(supplied.audit().correlation_id, "corr-42");
    assert_eq!(supplied.to_envelope().correlation_id, "corr-42");

    let first = pipeline
        .execute(
            build_context("op", None, None, None),
            asset("X"),
            &name_required,
            &AcceptAll,
            &executor,
        )
        .await;
    let second = pipeline
        .execute(
            build_context("op", None, None, None),
            asset("X"),
            &name_required,
            &AcceptAll,
            &executor,
        )
        .await;
    assert_ne!(first.correlation_id(), second.correlation_id());

    // Correlation id never influences the outcome
    assert!(first.same_outcome(&supplied));
}

#[tokio::test]
async fn test_failures_carry_correlation_id() {
    let pipeline = pipeline();
    let executor = CountingExecutor::default();

    let result = pipeline
        .execute(
            build_context("op", Some("corr-fail".to_string()), None, None),
            asset(""),
            &name_required,
            &AcceptAll,
            &executor,
        )
        .await;

    let envelope = result.to_envelope();
    assert_eq!(envelope.correlation_id, "corr-fail");
    assert_eq!(envelope.error_code.as_deref(), Some(codes::VALIDATION_FAILED));
    assert_eq!(envelope.failure_category, Some(FailureCategory::ValidationFailure));
}
