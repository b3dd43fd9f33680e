//! Idempotency store: at-most-one effective execution per idempotency key.
//!
//! ## Protocol
//!
//! 1. Caller fingerprints the request and calls [`IdempotencyStore::try_begin`]
//! 2. The store decides, atomically per key:
//!    - Unseen key (or expired record): create an in-progress record, `ProceedFresh`
//!    - Same fingerprint, completed: `ReplayCompleted` with the cached outcome
//!    - Different fingerprint: `Conflict`
//!    - Same fingerprint, in progress: `WaitInProgress` (or a takeover once the
//!      lease has expired)
//! 3. A `ProceedFresh` caller owns a [`Claim`] and must hand it back through
//!    [`IdempotencyStore::complete`] with the outcome, success or failure
//!
//! The in-memory implementation keys a sharded map ([`DashMap`]); all decisions
//! for one key happen under that key's shard lock. A shared backend for
//! multi-instance deployments implements the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IdempotencySettings;
use crate::domain::Failure;

use super::clock::{Clock, SystemClock};
use super::fingerprint::RequestFingerprint;

/// Lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    InProgress,
    Completed,
}

/// Snapshot of a finished run, stored for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CachedOutcome {
    Succeeded {
        payload: serde_json::Value,
        stages_completed: u8,
    },
    Failed {
        failure: Failure,
        stages_completed: u8,
    },
}

impl CachedOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn stages_completed(&self) -> u8 {
        match self {
            Self::Succeeded {
                stages_completed, ..
            }
            | Self::Failed {
                stages_completed, ..
            } => *stages_completed,
        }
    }
}

/// One idempotency key's record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub fingerprint: RequestFingerprint,
    pub state: RecordState,

    /// Present once the record is completed
    pub outcome: Option<CachedOutcome>,

    pub created_at: DateTime<Utc>,

    /// Lease deadline while in progress
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Retention deadline once completed
    pub expires_at: Option<DateTime<Utc>>,

    /// Token of the claim currently allowed to complete this record
    pub claim_token: Uuid,
}

impl IdempotencyRecord {
    /// Create an in-progress record owned by a fresh claim
    pub fn in_progress(
        key: &str,
        fingerprint: RequestFingerprint,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            idempotency_key: key.to_string(),
            fingerprint,
            state: RecordState::InProgress,
            outcome: None,
            created_at: now,
            lease_expires_at: Some(now + lease),
            completed_at: None,
            expires_at: None,
            claim_token: Uuid::new_v4(),
        }
    }

    /// Completed record past its retention window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Completed && self.expires_at.is_some_and(|at| at <= now)
    }

    /// In-progress record whose lease has run out
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::InProgress
            && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// In-progress record nobody renewed or took over for a whole retention window
    pub fn is_abandoned(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.state == RecordState::InProgress
            && self
                .lease_expires_at
                .is_some_and(|at| at + retention <= now)
    }

    fn claim(&self) -> Claim {
        Claim::new(self.idempotency_key.clone(), self.claim_token)
    }
}

/// Right to execute a request and complete its record.
///
/// Move-only: [`IdempotencyStore::complete`] consumes it, so one claim can
/// never complete twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Claim {
    key: String,
    token: Uuid,
}

impl Claim {
    pub fn new(key: String, token: Uuid) -> Self {
        Self { key, token }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// Decision returned by [`IdempotencyStore::try_begin`]
#[derive(Debug)]
pub enum BeginOutcome {
    /// Execute the pipeline, then complete the claim
    ProceedFresh(Claim),

    /// Return the cached outcome without executing
    ReplayCompleted(CachedOutcome),

    /// The key belongs to a different request
    Conflict,

    /// A duplicate submission is executing right now
    WaitInProgress,
}

/// Idempotency store errors
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The claim was taken over after its lease ran out
    #[error("Lease for idempotency key '{key}' was lost to another execution")]
    LeaseLost { key: String },

    /// The store was used in a way its protocol forbids
    #[error("Idempotency invariant violated for key '{key}': {detail}")]
    InvariantViolation { key: String, detail: String },

    /// Backend failure (shared-store implementations)
    #[error("Idempotency backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Store contract shared by in-memory and external backends
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically look up the key and decide how the caller proceeds
    async fn try_begin(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<BeginOutcome, IdempotencyError>;

    /// Transition a claimed record to completed with its outcome
    async fn complete(&self, claim: Claim, outcome: CachedOutcome) -> Result<(), IdempotencyError>;

    /// Wait until the key is no longer in progress.
    ///
    /// Returns `false` if the timeout elapsed first.
    async fn wait_for_completion(&self, key: &str, timeout: Duration) -> Result<bool, IdempotencyError>;

    /// Current record for a key
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Push the claim's lease forward. Fails with `LeaseLost` once taken over.
    async fn renew(&self, claim: &Claim) -> Result<(), IdempotencyError>;

    /// How long an unrenewed in-progress record blocks other executions
    fn lease(&self) -> Duration;
}

/// Record counts for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub in_progress: usize,
    pub completed: usize,
}

struct Slot {
    record: IdempotencyRecord,
    /// Flips to `true` when the record completes; waiters subscribe to it
    done: watch::Sender<bool>,
}

impl Slot {
    fn new(record: IdempotencyRecord) -> Self {
        let (done, _) = watch::channel(false);
        Self { record, done }
    }
}

/// Single-process idempotency store
pub struct InMemoryIdempotencyStore {
    slots: DashMap<String, Slot>,
    settings: IdempotencySettings,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(IdempotencySettings::default())
    }
}

impl std::fmt::Debug for InMemoryIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIdempotencyStore")
            .field("records", &self.slots.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(settings: IdempotencySettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: IdempotencySettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for slot in self.slots.iter() {
            match slot.record.state {
                RecordState::InProgress => stats.in_progress += 1,
                RecordState::Completed => stats.completed += 1,
            }
        }
        stats
    }

    /// Remove completed records past retention and in-progress records
    /// abandoned for as long. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let retention = self.settings.retention();
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            if slot.record.is_expired(now) {
                removed += 1;
                return false;
            }
            if slot.record.is_abandoned(now, retention) {
                // Release anyone still waiting on the dead run
                slot.done.send_replace(true);
                removed += 1;
                return false;
            }
            true
        });
        if removed > 0 {
            debug!(removed, "Purged expired idempotency records");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) on the configured interval
    pub fn spawn_purge_task(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.settings.purge_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.purge_expired();
            }
        })
    }

    fn begin(&self, key: &str, fingerprint: &RequestFingerprint) -> BeginOutcome {
        let now = self.clock.now();
        let lease = self.settings.lease();

        match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let record = IdempotencyRecord::in_progress(key, *fingerprint, now, lease);
                let claim = record.claim();
                vacant.insert(Slot::new(record));
                debug!(key, "Claimed unseen idempotency key");
                BeginOutcome::ProceedFresh(claim)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().record.is_expired(now) {
                    let record = IdempotencyRecord::in_progress(key, *fingerprint, now, lease);
                    let claim = record.claim();
                    occupied.insert(Slot::new(record));
                    debug!(key, "Replaced expired idempotency record");
                    return BeginOutcome::ProceedFresh(claim);
                }

                let slot = occupied.get_mut();
                if slot.record.fingerprint != *fingerprint {
                    return BeginOutcome::Conflict;
                }

                match slot.record.state {
                    RecordState::Completed => match slot.record.outcome.clone() {
                        Some(outcome) => BeginOutcome::ReplayCompleted(outcome),
                        None => {
                            debug_assert!(false, "completed record without outcome");
                            BeginOutcome::WaitInProgress
                        }
                    },
                    RecordState::InProgress if slot.record.is_lease_expired(now) => {
                        // Same sender: waiters on the old run are woken by the new one
                        slot.record.claim_token = Uuid::new_v4();
                        slot.record.lease_expires_at = Some(now + lease);
                        warn!(key, "Took over expired in-progress idempotency lease");
                        BeginOutcome::ProceedFresh(slot.record.claim())
                    }
                    RecordState::InProgress => BeginOutcome::WaitInProgress,
                }
            }
        }
    }

    fn finish(&self, claim: Claim, outcome: CachedOutcome) -> Result<(), IdempotencyError> {
        let now = self.clock.now();

        let Some(mut slot) = self.slots.get_mut(claim.key()) else {
            // Only reachable after a takeover whose record has since been purged
            return Err(IdempotencyError::LeaseLost { key: claim.key });
        };

        if slot.record.claim_token != claim.token() {
            return Err(IdempotencyError::LeaseLost { key: claim.key });
        }

        if slot.record.state == RecordState::Completed {
            debug_assert!(false, "idempotency key '{}' completed twice", claim.key());
            return Err(IdempotencyError::InvariantViolation {
                key: claim.key,
                detail: "record already completed".to_string(),
            });
        }

        slot.record.state = RecordState::Completed;
        slot.record.outcome = Some(outcome);
        slot.record.lease_expires_at = None;
        slot.record.completed_at = Some(now);
        slot.record.expires_at = Some(now + self.settings.retention());
        slot.done.send_replace(true);

        info!(key = claim.key(), "Idempotency record completed");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_begin(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<BeginOutcome, IdempotencyError> {
        Ok(self.begin(key, fingerprint))
    }

    async fn complete(&self, claim: Claim, outcome: CachedOutcome) -> Result<(), IdempotencyError> {
        self.finish(claim, outcome)
    }

    async fn wait_for_completion(&self, key: &str, timeout: Duration) -> Result<bool, IdempotencyError> {
        // Subscribe without holding the shard lock across the await
        let receiver = self.slots.get(key).map(|slot| slot.done.subscribe());
        let Some(mut receiver) = receiver else {
            return Ok(true);
        };

        let finished = tokio::time::timeout(timeout, receiver.wait_for(|done| *done))
            .await
            .is_ok();
        Ok(finished)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.slots.get(key).map(|slot| slot.record.clone()))
    }

    async fn renew(&self, claim: &Claim) -> Result<(), IdempotencyError> {
        let now = self.clock.now();
        match self.slots.get_mut(claim.key()) {
            Some(mut slot)
                if slot.record.claim_token == claim.token()
                    && slot.record.state == RecordState::InProgress =>
            {
                slot.record.lease_expires_at = Some(now + self.settings.lease());
                Ok(())
            }
            _ => Err(IdempotencyError::LeaseLost {
                key: claim.key().to_string(),
            }),
        }
    }

    fn lease(&self) -> Duration {
        Duration::from_secs(self.settings.lease_seconds)
    }
}
