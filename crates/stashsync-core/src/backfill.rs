//! Backfill synchronizer: heals the private relay group from the public one
//!
//! A device that was offline from the trusted group may have published
//! records that only reached the public (encrypted) group. The synchronizer
//! periodically reconciles the two:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  BackfillSynchronizer                                           │
//! │  ├── state: Idle -> Running -> (Idle | Error)                   │
//! │  ├── 1. since = max(checkpoint, now - cap window)               │
//! │  ├── 2. bulk query public group (records + tombstones)          │
//! │  ├── 3. dedupe by logical key (plaintext wins), subtract keys   │
//! │  │      already on the private group                            │
//! │  ├── 4. bounded worker pool: decrypt / re-sign / publish        │
//! │  └── 5. advance checkpoint, report counts                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bulk query failures abort the run and leave the checkpoint untouched;
//! per-record decrypt/sign/publish failures are logged and skipped without
//! aborting the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::category::Category;
use crate::error::{StashError, StashResult};
use crate::event::{dedupe_by_logical_key, Event, EventDraft, KIND_TOMBSTONE};
use crate::gateway::EncryptionGateway;
use crate::relay::{Filter, RelayGroup, RelayGroups};
use crate::signer::Signer;
use crate::store::LocalStore;

/// Synchronizer state machine
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackfillState {
    /// Not running
    #[default]
    Idle,
    /// A run is in progress
    Running,
    /// The last run aborted; message describes the batch failure
    Error(String),
}

/// Counts reported to the caller after a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Logical records considered after dedup and private-group diff
    pub candidates: usize,
    /// Records (and tombstones) republished to the private group
    pub published: usize,
    /// Records dropped by per-record failures
    pub skipped: usize,
}

/// Tunables for the synchronizer
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Cap on how far back a run may scan, bounding worst-case depth
    pub cap_window: Duration,
    /// Fixed interval of the periodic trigger
    pub interval: Duration,
    /// Concurrency limit of the per-record worker pool
    pub concurrency: usize,
    /// Timeout for the bulk relay queries
    pub bulk_timeout: Duration,
    /// Timeout for each per-record publish
    pub publish_timeout: Duration,
    /// Window inspected by the cheap pending-sync estimate
    pub pending_window: Duration,
    /// How long a pending-sync estimate stays cached
    pub pending_cache_ttl: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            cap_window: Duration::from_secs(90 * 24 * 60 * 60),
            interval: Duration::from_secs(30 * 60),
            concurrency: 4,
            bulk_timeout: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
            pending_window: Duration::from_secs(7 * 24 * 60 * 60),
            pending_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Reconciles the trusted relay group against the untrusted one.
///
/// Cloneable; clones share state, so one instance can serve both manual
/// triggers and the periodic task.
#[derive(Clone)]
pub struct BackfillSynchronizer {
    signer: Arc<dyn Signer>,
    gateway: Arc<EncryptionGateway>,
    store: Arc<LocalStore>,
    groups: RelayGroups,
    config: BackfillConfig,
    state: Arc<RwLock<BackfillState>>,
    pending_cache: Arc<Mutex<Option<(Instant, usize)>>>,
}

impl BackfillSynchronizer {
    pub fn new(
        signer: Arc<dyn Signer>,
        gateway: Arc<EncryptionGateway>,
        store: Arc<LocalStore>,
        groups: RelayGroups,
        config: BackfillConfig,
    ) -> Self {
        Self {
            signer,
            gateway,
            store,
            groups,
            config,
            state: Arc::new(RwLock::new(BackfillState::Idle)),
            pending_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Current state of the synchronizer
    pub async fn state(&self) -> BackfillState {
        self.state.read().await.clone()
    }

    /// Checkpoint scope id, one per owner identity
    fn scope(&self) -> String {
        format!("backfill:{}", self.signer.public_key())
    }

    /// Whether the periodic trigger should fire: dual relay-group
    /// configuration and signer capability must both hold
    pub fn preconditions_met(&self) -> bool {
        self.groups.has_private() && self.signer.can_encrypt()
    }

    /// Run a full backfill.
    ///
    /// Returns the report on success. Bulk query failures and cancellation
    /// surface as the batch error; the checkpoint is only advanced after a
    /// complete run.
    pub async fn run(&self, cancel: &CancellationToken) -> StashResult<BackfillReport> {
        let private = self.groups.private.clone().ok_or_else(|| {
            StashError::InvalidOperation("no private relay group configured".to_string())
        })?;
        if !self.signer.can_encrypt() {
            return Err(StashError::EncryptionUnavailable(
                "backfill needs the signer's decrypt capability".to_string(),
            ));
        }

        {
            let mut state = self.state.write().await;
            if *state == BackfillState::Running {
                return Err(StashError::InvalidOperation(
                    "backfill already running".to_string(),
                ));
            }
            *state = BackfillState::Running;
        }

        let result = self.run_inner(private, cancel).await;
        let mut state = self.state.write().await;
        match &result {
            Ok(report) => {
                info!(
                    candidates = report.candidates,
                    published = report.published,
                    skipped = report.skipped,
                    "backfill complete"
                );
                *state = BackfillState::Idle;
            }
            Err(e) => {
                warn!(error = %e, "backfill aborted");
                *state = BackfillState::Error(e.to_string());
            }
        }
        result
    }

    async fn run_inner(
        &self,
        private: Arc<dyn RelayGroup>,
        cancel: &CancellationToken,
    ) -> StashResult<BackfillReport> {
        let author = self.signer.public_key();
        let started_at = chrono::Utc::now().timestamp() as u64;
        let cap_floor = started_at.saturating_sub(self.config.cap_window.as_secs());
        let since = self
            .store
            .checkpoint(&self.scope())
            .unwrap_or(0)
            .max(cap_floor);

        let filter = Filter {
            kinds: record_kinds(),
            authors: vec![author],
            since: Some(since),
            ..Default::default()
        };

        debug!(since, "backfill querying relay groups");
        let source = query_with_timeout(
            self.groups.public.as_ref(),
            &filter,
            self.config.bulk_timeout,
            cancel,
        )
        .await?;
        let existing = query_with_timeout(
            private.as_ref(),
            &filter,
            self.config.bulk_timeout,
            cancel,
        )
        .await?;

        let have: HashSet<String> = existing.iter().map(|e| e.cache_key()).collect();
        let candidates: Vec<Event> = dedupe_by_logical_key(source)
            .into_iter()
            .filter(|e| !have.contains(&e.cache_key()))
            .collect();
        let candidate_count = candidates.len();

        // Bounded worker pool: at most `concurrency` decrypt/publish tasks
        // in flight; the full candidate list is processed to completion.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles: Vec<JoinHandle<StashResult<()>>> = Vec::with_capacity(candidate_count);
        for event in candidates {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| StashError::Cancelled)?;
            let this = self.clone();
            let private = private.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return Err(StashError::Cancelled);
                }
                this.heal_record(event, private.as_ref(), &cancel).await
            }));
        }

        let mut report = BackfillReport {
            candidates: candidate_count,
            ..Default::default()
        };
        let mut cancelled = false;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => report.published += 1,
                Ok(Err(StashError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    warn!(error = %e, "backfill record failed, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(error = %e, "backfill worker panicked, skipping");
                    report.skipped += 1;
                }
            }
        }
        if cancelled {
            return Err(StashError::Cancelled);
        }

        self.store.set_checkpoint(&self.scope(), started_at);
        Ok(report)
    }

    /// Copy one record from the public group to the private group.
    ///
    /// Tombstones republish unchanged. Ciphertext-marked records are
    /// decrypted, validated, and re-signed as new plaintext events with the
    /// same kind/tags/created_at; already-plaintext records republish as-is.
    async fn heal_record(
        &self,
        event: Event,
        private: &dyn RelayGroup,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        let healed = if event.is_tombstone() || !event.is_ciphertext() {
            event
        } else {
            let payload = self.gateway.decrypt_for_category(&event.content).await?;
            let draft = EventDraft {
                kind: event.kind,
                created_at: event.created_at,
                tags: event.tags.clone(),
                content: payload.to_json()?,
            };
            self.signer.sign_event(draft).await?
        };

        publish_with_timeout(private, &healed, self.config.publish_timeout, cancel).await?;
        self.store.put(std::slice::from_ref(&healed));
        debug!(id = %healed.id, "backfilled record to private group");
        Ok(())
    }

    /// Cheap estimate of how many logical records are out of sync.
    ///
    /// Diffs the logical-key sets of both groups over a short recent window;
    /// the result is cached briefly so polling UI does not hammer the
    /// relays. Requires the private group to be configured.
    pub async fn pending_sync_count(&self, cancel: &CancellationToken) -> StashResult<usize> {
        let private = self.groups.private.clone().ok_or_else(|| {
            StashError::InvalidOperation("no private relay group configured".to_string())
        })?;

        {
            let cache = self.pending_cache.lock().await;
            if let Some((at, count)) = *cache {
                if at.elapsed() < self.config.pending_cache_ttl {
                    return Ok(count);
                }
            }
        }

        let now = chrono::Utc::now().timestamp() as u64;
        let filter = Filter {
            kinds: record_kinds(),
            authors: vec![self.signer.public_key()],
            since: Some(now.saturating_sub(self.config.pending_window.as_secs())),
            ..Default::default()
        };

        let public_events = query_with_timeout(
            self.groups.public.as_ref(),
            &filter,
            self.config.bulk_timeout,
            cancel,
        )
        .await?;
        let private_events =
            query_with_timeout(private.as_ref(), &filter, self.config.bulk_timeout, cancel)
                .await?;

        let private_keys: HashSet<String> =
            private_events.iter().map(|e| e.cache_key()).collect();
        let count = dedupe_by_logical_key(public_events)
            .iter()
            .filter(|e| !private_keys.contains(&e.cache_key()))
            .count();

        *self.pending_cache.lock().await = Some((Instant::now(), count));
        Ok(count)
    }

    /// Spawn the periodic trigger.
    ///
    /// Re-runs the full backfill at the configured interval for as long as
    /// the preconditions hold; stops when the token is cancelled. Run
    /// failures are logged and the loop keeps going.
    pub fn spawn_periodic(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the engine does
            // not backfill at startup before the UI settles.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !this.preconditions_met() {
                            debug!("skipping periodic backfill, preconditions not met");
                            continue;
                        }
                        if let Err(e) = this.run(&cancel).await {
                            if matches!(e, StashError::Cancelled) {
                                break;
                            }
                            warn!(error = %e, "periodic backfill failed");
                        }
                    }
                }
            }
        })
    }
}

/// Kinds the backfill cares about: every category kind plus tombstones
fn record_kinds() -> Vec<u32> {
    let mut kinds: Vec<u32> = Category::ALL.iter().map(|c| c.kind()).collect();
    kinds.push(KIND_TOMBSTONE);
    kinds
}

async fn query_with_timeout(
    group: &dyn RelayGroup,
    filter: &Filter,
    timeout: Duration,
    cancel: &CancellationToken,
) -> StashResult<Vec<Event>> {
    if cancel.is_cancelled() {
        return Err(StashError::Cancelled);
    }
    tokio::select! {
        result = group.query(std::slice::from_ref(filter), cancel) => result,
        _ = cancel.cancelled() => Err(StashError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(StashError::Timeout(timeout)),
    }
}

async fn publish_with_timeout(
    group: &dyn RelayGroup,
    event: &Event,
    timeout: Duration,
    cancel: &CancellationToken,
) -> StashResult<()> {
    tokio::select! {
        result = group.publish(event, cancel) => result,
        _ = cancel.cancelled() => Err(StashError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(StashError::Timeout(timeout)),
    }
}
