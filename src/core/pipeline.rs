//! Staged, idempotent execution of state-mutating operations.
//!
//! Every run goes validate → check preconditions → execute, stopping at the
//! first failure, and always produces an audit summary. When the context
//! carries an idempotency key the run is wrapped by the idempotency store:
//! only one submission per key executes, every other one replays its outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glob::Pattern;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OrchestrationSettings;
use crate::domain::{
    codes, Failure, FailureCategory, OrchestrationContext, OrchestrationResult, Rejection,
    RunStats,
};

use super::clock::{Clock, SystemClock};
use super::fingerprint::RequestFingerprint;
use super::idempotency::{BeginOutcome, CachedOutcome, Claim, IdempotencyError, IdempotencyStore};
use super::policy::{Executor, PreconditionChecker, Validator};

/// Floor for the lease renewal period
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of the three stages, before any result is assembled
struct StageRun<T> {
    outcome: Result<T, Failure>,
    stages_completed: u8,
    executor_invocations: u32,
}

impl<T> StageRun<T> {
    fn rejected(category: FailureCategory, rejection: Rejection, stage: u8) -> Self {
        Self {
            outcome: Err(Failure::from_rejection(category, rejection)),
            stages_completed: stage,
            executor_invocations: 0,
        }
    }

    /// Failure raised before any stage ran
    fn refused(category: FailureCategory, code: &str, message: impl Into<String>) -> Self {
        Self {
            outcome: Err(Failure::new(category, code, message)),
            stages_completed: 0,
            executor_invocations: 0,
        }
    }
}

/// The staged executor, with its injected idempotency store
pub struct OrchestrationPipeline {
    store: Arc<dyn IdempotencyStore>,
    settings: OrchestrationSettings,
    key_required: Vec<Pattern>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OrchestrationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OrchestrationPipeline {
    /// Create a pipeline with default settings
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            settings: OrchestrationSettings::default(),
            key_required: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a pipeline with explicit settings
    pub fn with_settings(store: Arc<dyn IdempotencyStore>, settings: OrchestrationSettings) -> Result<Self> {
        let key_required = settings
            .require_idempotency_key
            .iter()
            .map(|p| {
                Pattern::new(p).with_context(|| format!("Invalid operation pattern: {}", p))
            })
            .collect::<Result<Vec<_>>>()?;

        if settings.wait_timeout() < settings.execution_timeout() {
            warn!(
                wait_timeout_ms = settings.wait_timeout_ms,
                execution_timeout_seconds = settings.execution_timeout_seconds,
                "Duplicates of slow requests will fail with REQUEST_IN_PROGRESS"
            );
        }

        Ok(Self {
            store,
            settings,
            key_required,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use a different clock for audit timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &OrchestrationSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Check whether an operation type must carry an idempotency key
    pub fn requires_idempotency_key(&self, operation_type: &str) -> bool {
        self.key_required.iter().any(|p| p.matches(operation_type))
    }

    /// Run one request through the pipeline.
    ///
    /// Never fails: every problem is reported as a categorized failure in the
    /// returned result.
    #[instrument(
        skip_all,
        fields(
            operation = %context.operation_type(),
            correlation_id = %context.correlation_id(),
        )
    )]
    pub async fn execute<R, T, V, P, E>(
        &self,
        context: OrchestrationContext,
        request: R,
        validator: &V,
        precondition: &P,
        executor: &E,
    ) -> OrchestrationResult<T>
    where
        R: Serialize + Send + Sync,
        T: Serialize + DeserializeOwned + Send,
        V: Validator<R>,
        P: PreconditionChecker<R>,
        E: Executor<R, T>,
    {
        let started = Instant::now();

        let Some(key) = context.idempotency_key() else {
            if self.requires_idempotency_key(context.operation_type()) {
                warn!("Idempotency key required but missing");
                let run = StageRun::refused(
                    FailureCategory::ValidationFailure,
                    codes::IDEMPOTENCY_KEY_REQUIRED,
                    format!(
                        "Operation '{}' requires an idempotency key",
                        context.operation_type()
                    ),
                );
                return self.finish(&context, run, false, started);
            }

            let run = self.run_stages(request, validator, precondition, executor).await;
            return self.finish(&context, run, false, started);
        };

        let fingerprint = match RequestFingerprint::of(context.operation_type(), &request) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!(error = %e, "Request cannot be fingerprinted");
                let run = StageRun::refused(
                    FailureCategory::ValidationFailure,
                    codes::REQUEST_NOT_FINGERPRINTABLE,
                    e.to_string(),
                );
                return self.finish(&context, run, false, started);
            }
        };

        let deadline = started + self.settings.wait_timeout();
        let claim = loop {
            let begin = match self.store.try_begin(key, &fingerprint).await {
                Ok(begin) => begin,
                Err(e) => {
                    error!(error = %e, "Idempotency store unavailable");
                    let run = StageRun::refused(
                        FailureCategory::ExecutionFailure,
                        codes::IDEMPOTENCY_STORE_UNAVAILABLE,
                        e.to_string(),
                    );
                    return self.finish(&context, run, false, started);
                }
            };

            match begin {
                BeginOutcome::ProceedFresh(claim) => break claim,
                BeginOutcome::ReplayCompleted(cached) => {
                    info!(idempotency_key = key, "Replaying completed request");
                    return self.replay(&context, cached, started);
                }
                BeginOutcome::Conflict => {
                    warn!(idempotency_key = key, "Idempotency key reused for a different request");
                    let run = StageRun::refused(
                        FailureCategory::IdempotencyConflict,
                        codes::IDEMPOTENCY_CONFLICT,
                        format!("Idempotency key '{}' was used for a different request", key),
                    );
                    return self.finish(&context, run, false, started);
                }
                BeginOutcome::WaitInProgress => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(idempotency_key = key, "Duplicate request still in progress");
                        let run = StageRun::refused(
                            FailureCategory::RequestInProgress,
                            codes::REQUEST_IN_PROGRESS,
                            format!("Request with idempotency key '{}' is still in progress", key),
                        );
                        return self.finish(&context, run, false, started);
                    }

                    debug!(idempotency_key = key, "Waiting for in-progress duplicate");
                    if let Err(e) = self.store.wait_for_completion(key, remaining).await {
                        error!(error = %e, "Idempotency store unavailable while waiting");
                        let run = StageRun::refused(
                            FailureCategory::ExecutionFailure,
                            codes::IDEMPOTENCY_STORE_UNAVAILABLE,
                            e.to_string(),
                        );
                        return self.finish(&context, run, false, started);
                    }
                }
            }
        };

        info!(idempotency_key = key, fingerprint = %fingerprint, "Executing fresh request");
        let mut run = self
            .run_stages_renewing(&claim, request, validator, precondition, executor)
            .await;

        let cached = match snapshot(&run) {
            Ok(cached) => cached,
            Err(failure) => {
                // Cache what the caller sees so replays stay identical
                run.outcome = Err(failure.clone());
                CachedOutcome::Failed {
                    failure,
                    stages_completed: run.stages_completed,
                }
            }
        };

        match self.store.complete(claim, cached).await {
            Ok(()) => self.finish(&context, run, false, started),
            Err(IdempotencyError::LeaseLost { .. }) => {
                warn!(idempotency_key = key, "Lease lost during execution, deferring to recorded outcome");
                self.recorded_outcome(&context, key, &fingerprint, run, started)
                    .await
            }
            Err(e) => {
                error!(idempotency_key = key, error = %e, "Failed to complete idempotency record");
                self.finish(&context, run, false, started)
            }
        }
    }

    /// Run the stages while renewing the claim's lease, so a live run is
    /// never taken over by a duplicate
    async fn run_stages_renewing<R, T, V, P, E>(
        &self,
        claim: &Claim,
        request: R,
        validator: &V,
        precondition: &P,
        executor: &E,
    ) -> StageRun<T>
    where
        R: Send + Sync,
        T: Send,
        V: Validator<R>,
        P: PreconditionChecker<R>,
        E: Executor<R, T>,
    {
        let period = (self.store.lease() / 3).max(MIN_RENEW_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stages = self.run_stages(request, validator, precondition, executor);
        tokio::pin!(stages);

        loop {
            tokio::select! {
                run = &mut stages => return run,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.renew(claim).await {
                        warn!(idempotency_key = claim.key(), error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }

    /// Outcome for a run whose claim was taken over: whatever the record
    /// finally holds, so every submission under the key sees one answer
    async fn recorded_outcome<T: DeserializeOwned>(
        &self,
        context: &OrchestrationContext,
        key: &str,
        fingerprint: &RequestFingerprint,
        run: StageRun<T>,
        started: Instant,
    ) -> OrchestrationResult<T> {
        if let Err(e) = self
            .store
            .wait_for_completion(key, self.settings.wait_timeout())
            .await
        {
            error!(idempotency_key = key, error = %e, "Idempotency store unavailable while waiting");
        }

        let record = match self.store.get(key).await {
            Ok(Some(record)) if record.fingerprint == *fingerprint => record,
            Ok(_) => return self.finish(context, run, false, started),
            Err(e) => {
                error!(idempotency_key = key, error = %e, "Idempotency store unavailable");
                return self.finish(context, run, false, started);
            }
        };

        match record.outcome {
            Some(cached) => {
                let mut recorded = decode_cached(cached);
                recorded.executor_invocations = run.executor_invocations;
                self.finish(context, recorded, true, started)
            }
            None => {
                let pending = StageRun {
                    outcome: Err(Failure::new(
                        FailureCategory::RequestInProgress,
                        codes::REQUEST_IN_PROGRESS,
                        format!("Request with idempotency key '{}' is still in progress", key),
                    )),
                    stages_completed: run.stages_completed,
                    executor_invocations: run.executor_invocations,
                };
                self.finish(context, pending, false, started)
            }
        }
    }

    /// Validation, precondition and execution, strictly in order
    async fn run_stages<R, T, V, P, E>(
        &self,
        request: R,
        validator: &V,
        precondition: &P,
        executor: &E,
    ) -> StageRun<T>
    where
        R: Send + Sync,
        T: Send,
        V: Validator<R>,
        P: PreconditionChecker<R>,
        E: Executor<R, T>,
    {
        if let Err(rejection) = validator.validate(&request) {
            warn!(reason = %rejection, "Validation failed");
            return StageRun::rejected(FailureCategory::ValidationFailure, rejection, 1);
        }
        debug!("Validation passed");

        if let Err(rejection) = precondition.check(&request).await {
            warn!(reason = %rejection, "Precondition failed");
            return StageRun::rejected(FailureCategory::PreconditionFailure, rejection, 2);
        }
        debug!("Preconditions passed");

        let timeout = self.settings.execution_timeout();
        let outcome = match tokio::time::timeout(timeout, executor.execute(request)).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => {
                error!(error = %format!("{:#}", e), "Execution failed");
                Err(execution_failure(e))
            }
            Err(_) => {
                error!(timeout_ms = millis(timeout), "Execution timed out");
                Err(Failure::new(
                    FailureCategory::ExecutionFailure,
                    codes::EXECUTION_TIMEOUT,
                    format!("Execution exceeded {}s", timeout.as_secs()),
                ))
            }
        };

        StageRun {
            outcome,
            stages_completed: 3,
            executor_invocations: 1,
        }
    }

    fn replay<T: DeserializeOwned>(
        &self,
        context: &OrchestrationContext,
        cached: CachedOutcome,
        started: Instant,
    ) -> OrchestrationResult<T> {
        self.finish(context, decode_cached(cached), true, started)
    }

    fn finish<T>(
        &self,
        context: &OrchestrationContext,
        run: StageRun<T>,
        replayed: bool,
        started: Instant,
    ) -> OrchestrationResult<T> {
        let stats = RunStats {
            stages_completed: run.stages_completed,
            executor_invocations: run.executor_invocations,
            replayed,
            duration_ms: millis(started.elapsed()),
            completed_at: self.clock.now(),
        };
        OrchestrationResult::new(context, run.outcome, stats)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Stage outcome rebuilt from a cached snapshot
fn decode_cached<T: DeserializeOwned>(cached: CachedOutcome) -> StageRun<T> {
    let stages_completed = cached.stages_completed();
    let outcome = match cached {
        CachedOutcome::Succeeded { payload, .. } => serde_json::from_value(payload).map_err(|e| {
            error!(error = %e, "Cached payload does not match the result type");
            Failure::new(
                FailureCategory::ExecutionFailure,
                codes::REPLAY_DECODE_FAILED,
                format!("Cached result could not be decoded: {}", e),
            )
        }),
        CachedOutcome::Failed { failure, .. } => Err(failure),
    };

    StageRun {
        outcome,
        stages_completed,
        executor_invocations: 0,
    }
}

/// Map an executor error, keeping the code of a [`Rejection`] if present
fn execution_failure(error: anyhow::Error) -> Failure {
    match error.downcast::<Rejection>() {
        Ok(rejection) => Failure::from_rejection(FailureCategory::ExecutionFailure, rejection),
        Err(error) => Failure::new(
            FailureCategory::ExecutionFailure,
            codes::EXECUTION_FAILED,
            format!("{:#}", error),
        ),
    }
}

fn snapshot<T: Serialize>(run: &StageRun<T>) -> Result<CachedOutcome, Failure> {
    match &run.outcome {
        Ok(payload) => {
            let payload = serde_json::to_value(payload).map_err(|e| {
                Failure::new(
                    FailureCategory::ExecutionFailure,
                    codes::RESULT_NOT_SERIALIZABLE,
                    format!("Result could not be cached: {}", e),
                )
            })?;
            Ok(CachedOutcome::Succeeded {
                payload,
                stages_completed: run.stages_completed,
            })
        }
        Err(failure) => Ok(CachedOutcome::Failed {
            failure: failure.clone(),
            stages_completed: run.stages_completed,
        }),
    }
}
