//! The cascading facade over the three storage tiers.
//!
//! Consistency rules:
//!
//! - Reads try memory → distributed → durable. A hit in a slower tier is
//!   promoted into the faster tiers by a spawned task, unless the key was
//!   written or deleted after the read began.
//! - Writes go to the durable tier first. If that fails nothing else is
//!   touched, so caches never hold a value the durable tier does not know.
//! - Deletes always make progress. A tier that cannot be reached is recorded
//!   as a *pending delete* for the key: reads skip that tier until
//!   [`UnifiedStorage::reconcile`] manages to delete the stale value.
//!
//! A cache write that fails after a successful durable write is recorded the
//! same way, since the tier may still hold the previous value.
//!
//! Pending deletes for the shared tiers are journaled under
//! [`PENDING_DELETES_KEY`] in both the durable and the distributed tier, so a
//! restarted process picks them up with
//! [`UnifiedStorage::restore_pending_deletes`].

use super::{CacheTier, TierError, TierKind};
use crate::config::StorageSettings;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Key of the pending-delete journal.
pub const PENDING_DELETES_KEY: &str = "storage:pending-deletes";

/// Mutation log entries outlive the last mutation of their key by this many
/// operation timeouts, longer than any read that could have overlapped it.
const MUTATION_LOG_RETENTION: u32 = 10;

/// Errors surfaced by [`UnifiedStorage`].
///
/// Faster-tier failures never appear here; they are logged and degraded.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable write of {key} failed: {source}")]
    DurableWrite { key: String, source: TierError },

    #[error("durable read of {key} failed: {source}")]
    DurableRead { key: String, source: TierError },

    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },

    #[error("stored value at {key} has an unexpected shape: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
}

/// Per-tier lifetimes used when writing or promoting into the caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTtls {
    pub memory: Duration,
    pub distributed: Duration,
}

impl TierTtls {
    fn for_tier(&self, kind: TierKind) -> Option<Duration> {
        match kind {
            TierKind::Memory => Some(self.memory),
            TierKind::Distributed => Some(self.distributed),
            TierKind::Durable => None,
        }
    }
}

/// Outcome of [`UnifiedStorage::delete`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Tiers that could not be reached; the key is pending reconciliation there.
    pub skipped: Vec<TierKind>,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn merge(&mut self, other: DeleteReport) {
        for tier in other.skipped {
            if !self.skipped.contains(&tier) {
                self.skipped.push(tier);
            }
        }
    }
}

/// Liveness of each tier, as reported by `/ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStatus {
    pub memory: bool,
    /// `None` when no distributed tier is configured.
    pub distributed: Option<bool>,
    pub durable: bool,
    pub pending_deletes: usize,
}

/// Persisted form of the pending deletes. The copy with the larger
/// `written_at` wins on restore.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingDeleteJournal {
    written_at: i64,
    entries: BTreeMap<String, Vec<TierKind>>,
}

/// Writes and deletes in progress or recently finished, per key.
struct MutationState {
    active: u32,
    /// Clock value when the last mutation finished.
    finished: u64,
    at: Instant,
}

/// Single storage service shared by every component of the process.
///
/// Cheap to clone; all clones share the same tiers and bookkeeping.
#[derive(Clone)]
pub struct UnifiedStorage {
    inner: Arc<Inner>,
}

struct Inner {
    memory: Arc<dyn CacheTier>,
    distributed: Option<Arc<dyn CacheTier>>,
    durable: Arc<dyn CacheTier>,
    ttls: TierTtls,
    op_timeout: Duration,
    /// Tiers that may hold a stale value for a key.
    pending_deletes: DashMap<String, Vec<TierKind>>,
    mutations: DashMap<String, MutationState>,
    clock: AtomicU64,
    journal_dirty: AtomicBool,
    journal_written_at: AtomicI64,
    journal_lock: tokio::sync::Mutex<()>,
}

impl UnifiedStorage {
    /// Build the facade. Pass `distributed: None` to run on two tiers.
    pub fn new(
        memory: Arc<dyn CacheTier>,
        distributed: Option<Arc<dyn CacheTier>>,
        durable: Arc<dyn CacheTier>,
        settings: &StorageSettings,
    ) -> Self {
        info!(
            distributed = distributed.is_some(),
            memory_ttl = ?settings.memory_ttl,
            distributed_ttl = ?settings.distributed_ttl,
            "Unified storage initialized"
        );
        Self {
            inner: Arc::new(Inner {
                memory,
                distributed,
                durable,
                ttls: TierTtls {
                    memory: settings.memory_ttl,
                    distributed: settings.distributed_ttl,
                },
                op_timeout: settings.operation_timeout,
                pending_deletes: DashMap::new(),
                mutations: DashMap::new(),
                clock: AtomicU64::new(0),
                journal_dirty: AtomicBool::new(false),
                journal_written_at: AtomicI64::new(0),
                journal_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn has_distributed(&self) -> bool {
        self.inner.distributed.is_some()
    }

    /// Fetch the value stored at `key`, or `None` on a total miss.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let stamp = self.inner.clock.load(Ordering::SeqCst);
        let stale = self.inner.stale_tiers(key);
        let is_stale = |kind: TierKind| stale.contains(&kind);

        if !is_stale(TierKind::Memory) {
            match self.inner.call(self.inner.memory.as_ref(), |t| t.get(key)).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => warn!(key, tier = %TierKind::Memory, error = %e, "Tier read failed, degrading"),
            }
        }

        let distributed = self
            .inner
            .distributed
            .as_ref()
            .filter(|_| !is_stale(TierKind::Distributed));
        if let Some(distributed) = distributed {
            match self.inner.call(distributed.as_ref(), |t| t.get(key)).await {
                Ok(Some(value)) => {
                    debug!(key, tier = %TierKind::Distributed, "Cache hit, promoting");
                    self.promote(key, &value, &[TierKind::Memory], &stale, stamp);
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => warn!(key, tier = %TierKind::Distributed, error = %e, "Tier read failed, degrading"),
            }
        }

        if is_stale(TierKind::Durable) {
            return Ok(None);
        }

        match self.inner.call(self.inner.durable.as_ref(), |t| t.get(key)).await {
            Ok(Some(value)) => {
                debug!(key, tier = %TierKind::Durable, "Durable hit, promoting");
                self.promote(key, &value, &[TierKind::Distributed, TierKind::Memory], &stale, stamp);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(StorageError::DurableRead {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// [`get`](Self::get) and deserialize.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StorageError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Store `value` at `key` with each tier's default lifetime.
    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.write(key, value, None).await
    }

    /// Store a value that must not outlive `ttl` in any cache tier.
    ///
    /// The durable tier still keeps it until deleted; callers that need hard
    /// expiry check an expiry field in the value on read.
    pub async fn set_expiring(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StorageError> {
        self.write(key, value, Some(ttl)).await
    }

    /// Serialize and [`set`](Self::set).
    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = encode(key, value)?;
        self.write(key, &value, None).await
    }

    /// Serialize and [`set_expiring`](Self::set_expiring).
    pub async fn set_typed_expiring<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let value = encode(key, value)?;
        self.write(key, &value, Some(ttl)).await
    }

    async fn write(&self, key: &str, value: &Value, cap: Option<Duration>) -> Result<(), StorageError> {
        {
            let _mutation = self.inner.begin_mutation(key);
            self.inner
                .call(self.inner.durable.as_ref(), |t| t.set(key, value, None))
                .await
                .map_err(|source| StorageError::DurableWrite {
                    key: key.to_string(),
                    source,
                })?;
            self.inner.clear_stale(key, TierKind::Durable);

            for tier in self.inner.cache_tiers() {
                let kind = tier.kind();
                let ttl = capped(self.inner.ttls.for_tier(kind), cap);
                match self.inner.call(tier.as_ref(), |t| t.set(key, value, ttl)).await {
                    Ok(()) => self.inner.clear_stale(key, kind),
                    Err(e) => {
                        warn!(key, tier = %kind, error = %e, "Cache write failed, marking tier stale");
                        self.inner.mark_stale(key, kind);
                    }
                }
            }
        }
        self.inner.flush_journal().await;
        Ok(())
    }

    /// Remove `key` from every tier.
    ///
    /// Never fails: unreachable tiers are skipped, reported, and retried by
    /// [`reconcile`](Self::reconcile). Reads ignore skipped tiers meanwhile.
    pub async fn delete(&self, key: &str) -> DeleteReport {
        let mut report = DeleteReport::default();
        {
            let _mutation = self.inner.begin_mutation(key);
            for tier in self.inner.tiers_slowest_first() {
                let kind = tier.kind();
                match self.inner.call(tier.as_ref(), |t| t.delete(key)).await {
                    Ok(()) => self.inner.clear_stale(key, kind),
                    Err(e) => {
                        warn!(key, tier = %kind, error = %e, "Tier delete failed, pending reconciliation");
                        self.inner.mark_stale(key, kind);
                        report.skipped.push(kind);
                    }
                }
            }
        }
        self.inner.flush_journal().await;
        report
    }

    /// Retry pending deletes. Returns how many keys are still pending.
    pub async fn reconcile(&self) -> usize {
        let snapshot: Vec<(String, Vec<TierKind>)> = self
            .inner
            .pending_deletes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, tiers) in snapshot {
            let _mutation = self.inner.begin_mutation(&key);
            for kind in tiers {
                // A write since the snapshot has already replaced the value.
                if !self.inner.stale_tiers(&key).contains(&kind) {
                    continue;
                }
                let Some(tier) = self.inner.tier(kind) else {
                    self.inner.clear_stale(&key, kind);
                    continue;
                };
                match self.inner.call(tier.as_ref(), |t| t.delete(&key)).await {
                    Ok(()) => {
                        debug!(key = %key, tier = %kind, "Reconciled pending delete");
                        self.inner.clear_stale(&key, kind);
                    }
                    Err(e) => {
                        debug!(key = %key, tier = %kind, error = %e, "Pending delete still failing");
                    }
                }
            }
        }

        self.inner.flush_journal().await;
        self.pending_delete_count()
    }

    pub fn pending_delete_count(&self) -> usize {
        self.inner.pending_deletes.len()
    }

    /// Load the journal left by a previous process and merge it into the
    /// pending deletes. Returns how many keys it contributed.
    ///
    /// Both journal copies are read and the newer one wins. Unreadable
    /// copies are logged and skipped.
    pub async fn restore_pending_deletes(&self) -> usize {
        let mut newest: Option<PendingDeleteJournal> = None;
        for tier in self.inner.journal_tiers() {
            let kind = tier.kind();
            let raw = match self.inner.call(tier.as_ref(), |t| t.get(PENDING_DELETES_KEY)).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(tier = %kind, error = %e, "Could not read the pending-delete journal");
                    continue;
                }
            };
            let journal: PendingDeleteJournal = match serde_json::from_value(raw) {
                Ok(journal) => journal,
                Err(e) => {
                    warn!(tier = %kind, error = %e, "Ignoring an unreadable pending-delete journal");
                    continue;
                }
            };
            let newer = match &newest {
                Some(current) => journal.written_at > current.written_at,
                None => true,
            };
            if newer {
                newest = Some(journal);
            }
        }

        let Some(journal) = newest else {
            return 0;
        };
        self.inner
            .journal_written_at
            .fetch_max(journal.written_at, Ordering::SeqCst);
        let restored = journal.entries.len();
        for (key, tiers) in journal.entries {
            for kind in tiers {
                if self.inner.tier(kind).is_some() {
                    self.inner.mark_stale(&key, kind);
                }
            }
        }
        if restored > 0 {
            info!(keys = restored, "Restored pending deletes from the journal");
        }
        restored
    }

    /// Drop mutation log entries too old to affect any read still running.
    pub fn prune_mutation_log(&self) {
        let retention = self.inner.op_timeout * MUTATION_LOG_RETENTION;
        self.inner
            .mutations
            .retain(|_, state| state.active > 0 || state.at.elapsed() < retention);
    }

    pub fn mutation_log_len(&self) -> usize {
        self.inner.mutations.len()
    }

    /// Ping every tier.
    pub async fn status(&self) -> StorageStatus {
        let memory = self.inner.call(self.inner.memory.as_ref(), |t| t.ping()).await.is_ok();
        let distributed = match &self.inner.distributed {
            Some(tier) => Some(self.inner.call(tier.as_ref(), |t| t.ping()).await.is_ok()),
            None => None,
        };
        let durable = self.inner.call(self.inner.durable.as_ref(), |t| t.ping()).await.is_ok();
        StorageStatus {
            memory,
            distributed,
            durable,
            pending_deletes: self.pending_delete_count(),
        }
    }

    /// Copy `value` into the `targets` tiers in the background.
    ///
    /// `stamp` is the clock value when the read began. Nothing is copied
    /// once the key has been written or deleted since then; a copy that
    /// raced such a mutation is removed again.
    fn promote(&self, key: &str, value: &Value, targets: &[TierKind], stale: &[TierKind], stamp: u64) {
        let tiers: Vec<Arc<dyn CacheTier>> = targets
            .iter()
            .filter(|kind| !stale.contains(kind))
            .filter_map(|kind| self.inner.tier(*kind))
            .collect();
        if tiers.is_empty() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let value = value.clone();
        tokio::spawn(async move {
            for tier in tiers {
                if !inner.unchanged_since(&key, stamp) {
                    debug!(key = %key, "Key changed during the read, promotion dropped");
                    return;
                }
                let kind = tier.kind();
                let ttl = inner.ttls.for_tier(kind);
                if let Err(e) = inner.call(tier.as_ref(), |t| t.set(&key, &value, ttl)).await {
                    warn!(key = %key, tier = %kind, error = %e, "Promotion failed");
                    continue;
                }
                if inner.unchanged_since(&key, stamp) {
                    continue;
                }
                debug!(key = %key, tier = %kind, "Promotion raced a mutation, removing the copy");
                if let Err(e) = inner.call(tier.as_ref(), |t| t.delete(&key)).await {
                    warn!(key = %key, tier = %kind, error = %e, "Could not remove a raced promotion");
                    inner.mark_stale(&key, kind);
                    inner.flush_journal().await;
                }
                return;
            }
        });
    }
}

/// Marks one write or delete of a key as running until dropped.
struct MutationGuard<'a> {
    inner: &'a Inner,
    key: String,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        let finished = self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut state) = self.inner.mutations.get_mut(&self.key) {
            state.active = state.active.saturating_sub(1);
            state.finished = finished;
            state.at = Instant::now();
        }
    }
}

impl Inner {
    /// Run one tier operation under the configured timeout.
    async fn call<'a, T, F, Fut>(&self, tier: &'a dyn CacheTier, op: F) -> Result<T, TierError>
    where
        F: FnOnce(&'a dyn CacheTier) -> Fut,
        Fut: Future<Output = Result<T, TierError>> + 'a,
    {
        match tokio::time::timeout(self.op_timeout, op(tier)).await {
            Ok(result) => result,
            Err(_) => Err(TierError::Timeout {
                tier: tier.kind(),
                after: self.op_timeout,
            }),
        }
    }

    fn begin_mutation(&self, key: &str) -> MutationGuard<'_> {
        self.mutations
            .entry(key.to_string())
            .and_modify(|state| state.active += 1)
            .or_insert_with(|| MutationState {
                active: 1,
                finished: 0,
                at: Instant::now(),
            });
        MutationGuard {
            inner: self,
            key: key.to_string(),
        }
    }

    /// No write or delete of `key` has run since the clock read `stamp`.
    fn unchanged_since(&self, key: &str, stamp: u64) -> bool {
        match self.mutations.get(key) {
            Some(state) => state.active == 0 && state.finished <= stamp,
            None => true,
        }
    }

    fn stale_tiers(&self, key: &str) -> Vec<TierKind> {
        self.pending_deletes
            .get(key)
            .map(|tiers| tiers.clone())
            .unwrap_or_default()
    }

    fn mark_stale(&self, key: &str, kind: TierKind) {
        let mut entry = self.pending_deletes.entry(key.to_string()).or_default();
        if !entry.contains(&kind) {
            entry.push(kind);
            self.journal_dirty.store(true, Ordering::SeqCst);
        }
    }

    fn clear_stale(&self, key: &str, kind: TierKind) {
        if let Some(mut entry) = self.pending_deletes.get_mut(key) {
            let before = entry.len();
            entry.retain(|k| *k != kind);
            if entry.len() != before {
                self.journal_dirty.store(true, Ordering::SeqCst);
            }
        }
        self.pending_deletes.remove_if(key, |_, tiers| tiers.is_empty());
    }

    /// Persist the pending deletes if they changed since the last flush.
    ///
    /// The journal goes to every shared tier that accepts it. If none does
    /// it stays dirty and the next mutation tries again.
    async fn flush_journal(&self) {
        if !self.journal_dirty.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.journal_lock.lock().await;
        if !self.journal_dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let journal = self.journal_snapshot();
        let value = match serde_json::to_value(&journal) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Could not encode the pending-delete journal");
                self.journal_dirty.store(true, Ordering::SeqCst);
                return;
            }
        };

        let mut saved = false;
        for tier in self.journal_tiers() {
            match self.call(tier.as_ref(), |t| t.set(PENDING_DELETES_KEY, &value, None)).await {
                Ok(()) => saved = true,
                Err(e) => debug!(tier = %tier.kind(), error = %e, "Journal copy not written"),
            }
        }
        if saved {
            debug!(keys = journal.entries.len(), "Pending-delete journal written");
        } else {
            warn!("No tier accepted the pending-delete journal, will retry");
            self.journal_dirty.store(true, Ordering::SeqCst);
        }
    }

    /// The memory tier does not survive a restart, so it is left out.
    fn journal_snapshot(&self) -> PendingDeleteJournal {
        let entries = self
            .pending_deletes
            .iter()
            .filter_map(|entry| {
                let tiers: Vec<TierKind> = entry
                    .value()
                    .iter()
                    .copied()
                    .filter(|kind| *kind != TierKind::Memory)
                    .collect();
                (!tiers.is_empty()).then(|| (entry.key().clone(), tiers))
            })
            .collect();
        PendingDeleteJournal {
            written_at: self.next_journal_stamp(),
            entries,
        }
    }

    /// Wall-clock nanoseconds, forced to increase across writes.
    fn next_journal_stamp(&self) -> i64 {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        let previous = self
            .journal_written_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn journal_tiers(&self) -> Vec<Arc<dyn CacheTier>> {
        let mut tiers = vec![Arc::clone(&self.durable)];
        if let Some(distributed) = &self.distributed {
            tiers.push(Arc::clone(distributed));
        }
        tiers
    }

    fn tier(&self, kind: TierKind) -> Option<Arc<dyn CacheTier>> {
        match kind {
            TierKind::Memory => Some(Arc::clone(&self.memory)),
            TierKind::Distributed => self.distributed.clone(),
            TierKind::Durable => Some(Arc::clone(&self.durable)),
        }
    }

    /// Distributed then memory, the order writes propagate in.
    fn cache_tiers(&self) -> Vec<Arc<dyn CacheTier>> {
        let mut tiers = Vec::with_capacity(2);
        if let Some(distributed) = &self.distributed {
            tiers.push(Arc::clone(distributed));
        }
        tiers.push(Arc::clone(&self.memory));
        tiers
    }

    fn tiers_slowest_first(&self) -> Vec<Arc<dyn CacheTier>> {
        let mut tiers = vec![Arc::clone(&self.durable)];
        tiers.extend(self.cache_tiers());
        tiers
    }
}

fn capped(ttl: Option<Duration>, cap: Option<Duration>) -> Option<Duration> {
    match (ttl, cap) {
        (Some(ttl), Some(cap)) => Some(ttl.min(cap)),
        (None, cap) => cap,
        (ttl, None) => ttl,
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StorageError> {
    serde_json::to_value(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })
}
