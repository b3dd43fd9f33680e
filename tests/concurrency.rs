//! Concurrency Integration Tests
//!
//! Duplicate submissions racing on one idempotency key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenflow::config::{IdempotencySettings, OrchestrationSettings};
use tokenflow::core::{
    AcceptAll, CachedOutcome, Executor, IdempotencyStore, InMemoryIdempotencyStore, ManualClock,
    RecordState,
};
use tokenflow::domain::codes;
use tokenflow::{
    build_context, FailureCategory, OperationType, OrchestrationPipeline, OrchestrationResult,
};
use tokio::sync::{Barrier, Notify};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateAsset {
    name: String,
}

fn asset(name: &str) -> CreateAsset {
    CreateAsset {
        name: name.to_string(),
    }
}

/// Slow executor that counts invocations
#[derive(Debug, Clone)]
struct SlowExecutor {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl SlowExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor<CreateAsset, String> for SlowExecutor {
    async fn execute(&self, request: CreateAsset) -> anyhow::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(format!("created-{}-{}", request.name, n))
    }
}

/// Executor whose first invocation blocks until released
#[derive(Debug, Clone, Default)]
struct GatedExecutor {
    calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
}

impl Executor<CreateAsset, String> for GatedExecutor {
    async fn execute(&self, request: CreateAsset) -> anyhow::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.gate.notified().await;
        }
        Ok(format!("created-{}-{}", request.name, n))
    }
}

async fn submit<E: Executor<CreateAsset, String>>(
    pipeline: &OrchestrationPipeline,
    key: &str,
    request: CreateAsset,
    executor: &E,
) -> OrchestrationResult<String> {
    let ctx = build_context(
        OperationType::DEPLOY_ARC200,
        None,
        Some(key.to_string()),
        None,
    );
    pipeline
        .execute(ctx, request, &AcceptAll, &AcceptAll, executor)
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_execute_once() {
    const SUBMISSIONS: usize = 5;

    let pipeline = Arc::new(OrchestrationPipeline::new(Arc::new(
        InMemoryIdempotencyStore::default(),
    )));
    let executor = SlowExecutor::new(Duration::from_millis(100));
    let barrier = Arc::new(Barrier::new(SUBMISSIONS));

    let mut handles = Vec::new();
    for _ in 0..SUBMISSIONS {
        let pipeline = pipeline.clone();
        let executor = executor.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            submit(&pipeline, "k-race", asset("X"), &executor).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(executor.calls(), 1);

    let fresh: Vec<_> = results.iter().filter(|r| !r.is_replay()).collect();
    assert_eq!(fresh.len(), 1);

    for result in &results {
        assert!(result.is_success());
        assert!(result.same_outcome(fresh[0]));
        assert_eq!(result.payload().map(String::as_str), Some("created-X-0"));
    }

    let invocations: u32 = results.iter().map(|r| r.audit().executor_invocations).sum();
    assert_eq!(invocations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let pipeline = Arc::new(OrchestrationPipeline::new(Arc::new(
        InMemoryIdempotencyStore::default(),
    )));
    let executor = SlowExecutor::new(Duration::from_millis(20));

    let mut handles = Vec::new();
    for i in 0..4 {
        let pipeline = pipeline.clone();
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            submit(&pipeline, &format!("k-{}", i), asset("X"), &executor).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_success());
        assert!(!result.is_replay());
    }
    assert_eq!(executor.calls(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_timeout_reports_in_progress() {
    let settings = OrchestrationSettings {
        wait_timeout_ms: 50,
        ..OrchestrationSettings::default()
    };
    let pipeline = Arc::new(
        OrchestrationPipeline::with_settings(
            Arc::new(InMemoryIdempotencyStore::default()),
            settings,
        )
        .unwrap(),
    );
    let executor = GatedExecutor::default();

    let first = {
        let pipeline = pipeline.clone();
        let executor = executor.clone();
        tokio::spawn(async move { submit(&pipeline, "k-slow", asset("X"), &executor).await })
    };

    while executor.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let waiting = submit(&pipeline, "k-slow", asset("X"), &executor).await;
    assert_eq!(waiting.failure_category(), Some(FailureCategory::RequestInProgress));
    assert_eq!(waiting.error_code(), Some(codes::REQUEST_IN_PROGRESS));
    assert_eq!(waiting.http_status(), 425);

    executor.gate.notify_one();
    let first = first.await.unwrap();
    assert!(first.is_success());

    // The in-progress answer was not cached
    let replay = submit(&pipeline, "k-slow", asset("X"), &executor).await;
    assert!(replay.is_replay());
    assert!(replay.same_outcome(&first));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_lease_is_taken_over() {
    let clock = ManualClock::default();
    let settings = IdempotencySettings {
        lease_seconds: 10,
        ..IdempotencySettings::default()
    };
    let store = Arc::new(InMemoryIdempotencyStore::with_clock(
        settings,
        Arc::new(clock.clone()),
    ));
    let pipeline = Arc::new(OrchestrationPipeline::new(store.clone()));
    let executor = GatedExecutor::default();

    let stalled = {
        let pipeline = pipeline.clone();
        let executor = executor.clone();
        tokio::spawn(async move { submit(&pipeline, "k-lease", asset("X"), &executor).await })
    };

    while executor.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let record = store.get("k-lease").await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::InProgress);

    clock.advance(chrono::Duration::seconds(11));

    let takeover = submit(&pipeline, "k-lease", asset("X"), &executor).await;
    assert!(takeover.is_success());
    assert!(!takeover.is_replay());
    assert_eq!(takeover.payload().map(String::as_str), Some("created-X-1"));

    // The stalled run finishes late; its completion is refused and its
    // caller gets the recorded outcome instead of its own
    executor.gate.notify_one();
    let stalled = stalled.await.unwrap();
    assert!(stalled.is_success());
    assert!(stalled.same_outcome(&takeover));
    assert!(stalled.is_replay());
    assert_eq!(stalled.audit().executor_invocations, 1);

    let record = store.get("k-lease").await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::Completed);
    match record.outcome {
        Some(CachedOutcome::Succeeded { payload, .. }) => assert_eq!(payload, "created-X-1"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

fn short_lease_pipeline(wait_timeout_ms: u64) -> Arc<OrchestrationPipeline> {
    let store = InMemoryIdempotencyStore::new(IdempotencySettings {
        lease_seconds: 1,
        ..IdempotencySettings::default()
    });
    let settings = OrchestrationSettings {
        execution_timeout_seconds: 4,
        wait_timeout_ms,
        ..OrchestrationSettings::default()
    };
    Arc::new(OrchestrationPipeline::with_settings(Arc::new(store), settings).unwrap())
}

async fn race(
    pipeline: &Arc<OrchestrationPipeline>,
    executor: &SlowExecutor,
    key: &str,
    submissions: usize,
) -> Vec<OrchestrationResult<String>> {
    let barrier = Arc::new(Barrier::new(submissions));
    let mut handles = Vec::new();
    for _ in 0..submissions {
        let pipeline = pipeline.clone();
        let executor = executor.clone();
        let barrier = barrier.clone();
        let key = key.to_string();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            submit(&pipeline, &key, asset("X"), &executor).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executor_outliving_lease_runs_once() {
    let pipeline = short_lease_pipeline(5_000);
    let executor = SlowExecutor::new(Duration::from_millis(2_200));

    let results = race(&pipeline, &executor, "k-long", 3).await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(results.iter().filter(|r| !r.is_replay()).count(), 1);
    for result in &results {
        assert!(result.is_success());
        assert!(result.same_outcome(&results[0]));
        assert_eq!(result.payload().map(String::as_str), Some("created-X-0"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_wait_never_executes_twice() {
    let pipeline = short_lease_pipeline(1_000);
    let executor = SlowExecutor::new(Duration::from_millis(2_000));

    let results = race(&pipeline, &executor, "k-impatient", 3).await;

    assert_eq!(executor.calls(), 1);
    let successes: Vec<_> = results.iter().filter(|r| r.is_success()).collect();
    assert_eq!(successes.len(), 1);
    for result in results.iter().filter(|r| !r.is_success()) {
        assert_eq!(result.error_code(), Some(codes::REQUEST_IN_PROGRESS));
    }

    // A retry after the run finished replays the single outcome
    let retry = submit(&pipeline, "k-impatient", asset("X"), &executor).await;
    assert!(retry.is_replay());
    assert!(retry.same_outcome(successes[0]));
    assert_eq!(executor.calls(), 1);
}
