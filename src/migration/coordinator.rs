//! Drives one migration from the legacy store to the new store.
//!
//! The run is a linear state machine (see [`Phase`]). Every destructive write
//! happens under the namespace lease and after a verified snapshot exists, and
//! the version marker is the last write of a successful run. A crash before
//! that write leaves the old version in place, so the next start simply runs
//! again, reusing the retained snapshot as its rollback baseline.

use log::{debug, error, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result, StorageError};
use crate::migration::batch::AdaptiveBatcher;
use crate::migration::checksum::{self, ChecksumIndex, KeyChecksum};
use crate::migration::journal::{MigrationJournal, MigrationRecord, RecordStatus};
use crate::migration::lock::{AcquireAttempt, LeaseLock, LockRecord};
use crate::migration::marker::{self, VersionMarker, VersionPlan};
use crate::migration::rate_limit::{AttemptRecord, RateLimiter};
use crate::migration::snapshot::{Snapshot, SnapshotManager};
use crate::migration::status::{
    self, KeyFailure, MigrationStatus, Phase, StatusObserver, StatusReporter,
};
use crate::retry::RetryPolicy;
use crate::storage::{ReservedKeys, StorageAdapter, hex_encode};

/// When per-key failures stop being warnings and fail the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Largest tolerated share of failed keys.
    pub max_failed_ratio: f64,
    /// Optional absolute cap on failed keys.
    pub max_failed_keys: Option<usize>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failed_ratio: 0.05,
            max_failed_keys: None,
        }
    }
}

impl FailurePolicy {
    pub fn exceeded(&self, failed: usize, total: usize) -> bool {
        if failed == 0 {
            return false;
        }
        let ratio = failed as f64 / total.max(1) as f64;
        ratio > self.max_failed_ratio || self.max_failed_keys.is_some_and(|max| failed > max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migration_id: String,
    pub version_from: u32,
    pub version_to: u32,
    pub copied_keys: usize,
    pub bytes_copied: u64,
    pub failed_keys: Vec<KeyFailure>,
    pub snapshot_id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The marker already satisfied the target; nothing was written.
    AlreadyCurrent { version: u32 },
    /// No legacy data existed; the marker was stamped without copying.
    FreshInstall { version: u32 },
    Completed(MigrationReport),
    /// Committed, but some keys could not be read and stay in the legacy store.
    CompletedWithWarnings(MigrationReport),
    /// Another context holds the lease; see [`MigrationCoordinator::wait_for_completion`].
    Deferred { holder: String },
}

/// Per-run scratch state, kept outside the phases so failure handling can see it.
struct RunState {
    started_ms: u64,
    snapshot: Option<Snapshot>,
    index: ChecksumIndex,
    failures: Vec<KeyFailure>,
    bytes_copied: u64,
    budget_exceeded: bool,
}

pub struct MigrationCoordinator {
    source: Arc<dyn StorageAdapter>,
    destination: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    config: MigrationConfig,
    holder_id: String,
    retry: RetryPolicy,
    reserved: ReservedKeys,
    lock: LeaseLock,
    snapshots: SnapshotManager,
    limiter: RateLimiter,
    journal: MigrationJournal,
    marker: VersionMarker,
    reporter: StatusReporter,
}

impl MigrationCoordinator {
    /// Control records (lock, snapshots, journal, marker) live in `destination`,
    /// which every context must share.
    pub fn new(
        source: Arc<dyn StorageAdapter>,
        destination: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let retry = config.retry.policy();
        let reserved = ReservedKeys::new(&config.reserved_prefixes);
        let lock = LeaseLock::new(
            destination.clone(),
            clock.clone(),
            retry.clone(),
            config.lock.clone(),
        );
        let snapshots = SnapshotManager::new(
            destination.clone(),
            clock.clone(),
            retry.clone(),
            reserved.clone(),
        );
        let limiter = RateLimiter::new(
            destination.clone(),
            clock.clone(),
            retry.clone(),
            config.rate_limit.clone(),
            &config.migration_id,
        );
        let journal = MigrationJournal::new(
            destination.clone(),
            clock.clone(),
            retry.clone(),
            &config.migration_id,
        );
        let marker = VersionMarker::new(destination.clone(), clock.clone(), retry.clone());
        let reporter = StatusReporter::new(clock.clone());
        Ok(Self {
            source,
            destination,
            clock,
            holder_id: generate_holder_id(),
            config,
            retry,
            reserved,
            lock,
            snapshots,
            limiter,
            journal,
            marker,
            reporter,
        })
    }

    /// Name this context in lock records and journal entries.
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn status(&self) -> MigrationStatus {
        self.reporter.current()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.reporter.subscribe(observer);
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn stored_version(&self) -> Result<Option<u32>> {
        self.marker.read()
    }

    pub fn current_lock(&self) -> Result<Option<LockRecord>> {
        self.lock.current(&self.config.namespace)
    }

    pub fn history(&self) -> Result<Vec<MigrationRecord>> {
        self.journal.list()
    }

    pub fn attempts(&self) -> Result<AttemptRecord> {
        self.limiter.record()
    }

    /// Progress last published by the context that ran (or is running) the migration.
    pub fn published_progress(&self) -> Option<MigrationStatus> {
        status::read_published(self.destination.as_ref(), &self.config.namespace)
    }

    /// Clear a stuck flag after manual intervention.
    pub fn resolve_stuck(&self) -> Result<bool> {
        self.limiter.resolve()
    }

    /// Run the migration if it is due.
    ///
    /// Returns `Deferred` when another context holds the lease. Namespace-level
    /// failures restore the destination before the error is returned; the
    /// legacy store is never modified before the commit.
    pub fn start_migration(&self) -> Result<MigrationOutcome> {
        self.reporter.reset(&self.holder_id);
        self.reporter.set_phase(Phase::VersionCheck);
        let target = self.config.target_version;

        let stored = self.marker.read().map_err(|err| self.fail_early(err))?;
        if let Some(version) = stored
            && version >= target
        {
            self.resume_cleanup(version);
            self.reporter.set_phase(Phase::Completed);
            info!("store already at version {version}; nothing to migrate");
            return Ok(MigrationOutcome::AlreadyCurrent { version });
        }

        let legacy_present = self.legacy_present().map_err(|err| self.fail_early(err))?;
        let (from, to) = match marker::plan(stored, target, legacy_present)
            .map_err(|err| self.fail_early(err))?
        {
            VersionPlan::AlreadyCurrent { version } => {
                self.reporter.set_phase(Phase::Completed);
                return Ok(MigrationOutcome::AlreadyCurrent { version });
            }
            VersionPlan::FreshInstall => {
                self.marker.write(target).map_err(|err| self.fail_early(err))?;
                self.reporter.set_phase(Phase::Completed);
                info!("no legacy data found; stamped fresh install at version {target}");
                return Ok(MigrationOutcome::FreshInstall { version: target });
            }
            VersionPlan::Migrate { from, to } => (from, to),
        };

        self.limiter
            .ensure_allowed()
            .map_err(|err| self.fail_early(err))?;

        self.reporter.set_phase(Phase::AcquiringLock);
        let namespace = &self.config.namespace;
        match self.lock.acquire(namespace, &self.holder_id) {
            Ok(_) => {}
            Err(MigrationError::LockContention { holder, .. }) => {
                info!("migration of {namespace:?} is being run by {holder}; deferring");
                self.reporter.update(|status| {
                    status.phase = Phase::Idle;
                    status.deferred_to = Some(holder.clone());
                });
                return Ok(MigrationOutcome::Deferred { holder });
            }
            Err(err) => return Err(self.fail_early(err)),
        }

        // Another context may have committed while we waited for the lease.
        match self.marker.read() {
            Ok(Some(version)) if version >= target => {
                self.release_lock();
                self.reporter.set_phase(Phase::Completed);
                return Ok(MigrationOutcome::AlreadyCurrent { version });
            }
            Ok(_) => {}
            Err(err) => {
                self.release_lock();
                return Err(self.fail_early(err));
            }
        }

        if let Err(err) = self.limiter.record_attempt() {
            self.release_lock();
            return Err(self.fail_early(err));
        }
        let mut record = match self.journal.begin(from, to, &self.holder_id) {
            Ok(record) => record,
            Err(err) => {
                self.release_lock();
                return Err(self.fail_early(err));
            }
        };

        info!(
            "migrating {namespace:?} from version {from} to {to} as {}",
            self.holder_id
        );
        let mut state = RunState {
            started_ms: self.clock.now_ms(),
            snapshot: None,
            index: ChecksumIndex::new(),
            failures: Vec::new(),
            bytes_copied: 0,
            budget_exceeded: false,
        };
        match self.run_locked(&mut record, &mut state) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err, &mut record, &state)),
        }
    }

    /// Retry after a failed run. Cooldowns and the stuck flag still apply.
    pub fn retry_migration(&self) -> Result<MigrationOutcome> {
        self.limiter.ensure_allowed()?;
        if let Some(last) = self.journal.latest()? {
            debug!(
                "retrying migration {} (last run {:?})",
                self.config.migration_id, last.status
            );
        }
        self.start_migration()
    }

    /// Follow a migration run by another context until it finishes, its lease
    /// disappears, or `max_wait` passes, mirroring its published progress.
    pub fn wait_for_completion(&self, max_wait: Duration) -> Result<MigrationStatus> {
        let target = self.config.target_version;
        let namespace = &self.config.namespace;
        let poll = Duration::from_millis(self.config.lock.poll_interval_ms.max(1));
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(max_wait.as_millis() as u64);
        loop {
            let published = self.published_progress();
            if let Some(mirrored) = &published {
                self.mirror(mirrored);
            }

            if self.marker.read()?.is_some_and(|version| version >= target) {
                let phase = match published {
                    Some(progress) if progress.phase.is_terminal() => progress.phase,
                    _ => Phase::Completed,
                };
                return Ok(self.reporter.update(|status| {
                    status.phase = phase;
                    status.deferred_to = None;
                }));
            }

            if self.lock.current(namespace)?.is_none() {
                // Holder is gone without committing: it failed or crashed.
                debug!("lease on {namespace:?} released without a commit");
                return Ok(self.reporter.update(|status| {
                    if !status.phase.is_terminal() {
                        status.phase = Phase::Idle;
                    }
                    status.deferred_to = None;
                }));
            }

            if self.clock.now_ms() >= deadline {
                return Ok(self.status());
            }
            self.clock.sleep(poll);
        }
    }

    /// Put the destination back to a retained snapshot, under the lease.
    pub fn restore_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let namespace = &self.config.namespace;
        let snapshot = self
            .snapshots
            .load_snapshot(namespace, snapshot_id)?
            .ok_or_else(|| MigrationError::SnapshotMissing(snapshot_id.to_string()))?;
        self.lock.acquire(namespace, &self.holder_id)?;
        let restored = self.snapshots.restore_snapshot(&snapshot);
        self.release_lock();
        restored?;
        Ok(snapshot)
    }

    pub fn prune_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if self
            .snapshots
            .prune_snapshot(&self.config.namespace, snapshot_id)?
        {
            Ok(())
        } else {
            Err(MigrationError::SnapshotMissing(snapshot_id.to_string()))
        }
    }

    fn run_locked(
        &self,
        record: &mut MigrationRecord,
        state: &mut RunState,
    ) -> Result<MigrationOutcome> {
        self.enter(Phase::Snapshotting);
        let snapshot = self.baseline_snapshot(record)?;
        record.snapshot_id = Some(snapshot.id.clone());
        self.journal.save(record)?;
        state.snapshot = Some(snapshot);

        self.enter(Phase::Copying);
        self.copy_keys(state)?;
        let total = self.reporter.current().total_keys;
        if self.config.failure.exceeded(state.failures.len(), total) {
            return Err(MigrationError::FailureThresholdExceeded {
                failed: state.failures.len(),
                total,
            });
        }
        let index = &state.index;
        self.retry
            .run(self.clock.as_ref(), "save checksum index", || {
                index.save(self.destination.as_ref(), &self.config.migration_id)
            })?;

        self.enter(Phase::Verifying);
        self.verify_copy(state)?;

        self.enter(Phase::Committing);
        self.heartbeat()?;
        self.marker.write(record.version_to)?;
        info!(
            "committed {:?} at version {}",
            self.config.namespace, record.version_to
        );

        record.status = RecordStatus::Committed;
        record.copied_keys = state.index.key_count();
        record.failed_keys = state.failures.iter().map(|f| f.key.clone()).collect();
        if let Err(err) = self.journal.save(record) {
            warn!("could not journal commit: {err}");
        }
        if let Err(err) = self.limiter.record_success() {
            warn!("could not reset attempt record: {err}");
        }

        self.enter(Phase::CleaningUp);
        let snapshot_id = record.snapshot_id.clone().unwrap_or_default();
        let clean = self.clean_up(&snapshot_id, &state.index);
        let warnings = !state.failures.is_empty();
        let final_status = if warnings {
            RecordStatus::CompletedWithWarnings
        } else {
            RecordStatus::Completed
        };
        if clean {
            if let Err(err) = self.journal.finish(record, final_status) {
                warn!("could not journal completion: {err}");
            }
        } else {
            warn!("cleanup incomplete; it will be resumed on the next start");
        }

        let report = MigrationReport {
            migration_id: self.config.migration_id.clone(),
            version_from: record.version_from,
            version_to: record.version_to,
            copied_keys: state.index.key_count(),
            bytes_copied: state.bytes_copied,
            failed_keys: state.failures.clone(),
            snapshot_id,
            duration_ms: self.clock.now_ms().saturating_sub(state.started_ms),
        };
        if warnings {
            warn!(
                "migration finished with {} unreadable key(s) left in the legacy store",
                report.failed_keys.len()
            );
            self.enter(Phase::CompletedWithWarnings);
            Ok(MigrationOutcome::CompletedWithWarnings(report))
        } else {
            self.enter(Phase::Completed);
            Ok(MigrationOutcome::Completed(report))
        }
    }

    /// Snapshot to roll back to. An interrupted earlier run's snapshot takes
    /// precedence because the destination may already hold its partial writes.
    fn baseline_snapshot(&self, current: &MigrationRecord) -> Result<Snapshot> {
        let namespace = &self.config.namespace;
        for mut earlier in self.journal.list()?.into_iter().rev() {
            if earlier.started_at_ms == current.started_at_ms
                || earlier.version_to != current.version_to
                || matches!(
                    earlier.status,
                    RecordStatus::Completed | RecordStatus::CompletedWithWarnings
                )
            {
                continue;
            }
            let Some(id) = earlier.snapshot_id.clone() else {
                continue;
            };
            match self.snapshots.load_snapshot(namespace, &id)? {
                Some(snapshot) if snapshot.verify() => {
                    info!(
                        "reusing snapshot {id} retained by the run started at {}",
                        earlier.started_at_ms
                    );
                    if earlier.status == RecordStatus::Running {
                        earlier.error = Some("interrupted".to_string());
                        if let Err(err) = self.journal.finish(&mut earlier, RecordStatus::Failed) {
                            warn!("could not close interrupted journal entry: {err}");
                        }
                    }
                    return Ok(snapshot);
                }
                Some(_) => warn!("retained snapshot {id} failed verification; ignoring it"),
                None => {}
            }
        }
        self.snapshots.create_snapshot(namespace, current.version_to)
    }

    fn copy_keys(&self, state: &mut RunState) -> Result<()> {
        let namespace = &self.config.namespace;
        let keys = self.retry.run(self.clock.as_ref(), "list legacy keys", || {
            self.reserved.user_keys(self.source.as_ref(), namespace)
        })?;
        self.reporter.update(|status| status.total_keys = keys.len());

        let mut batcher = AdaptiveBatcher::new(self.config.batch.clone());
        let mut processed = 0;
        while processed < keys.len() {
            let end = (processed + batcher.size()).min(keys.len());
            let batch_started = self.clock.now_ms();
            for key in &keys[processed..end] {
                let value = match self
                    .retry
                    .run(self.clock.as_ref(), "read legacy key", || self.source.get(key))
                {
                    Ok(Some(value)) => value,
                    Ok(None) => {
                        debug!("{key} vanished before it was read; skipping");
                        continue;
                    }
                    Err(err @ (StorageError::Unavailable(_) | StorageError::QuotaExceeded(_))) => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        warn!("cannot read {key}; leaving it in the legacy store: {err}");
                        state.failures.push(KeyFailure {
                            key: key.clone(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };
                self.retry
                    .run(self.clock.as_ref(), "write destination key", || {
                        self.destination.set(key, &value)
                    })?;
                let checksum = KeyChecksum::of(key, &value);
                state.bytes_copied += checksum.byte_len;
                state.index.record(checksum);
            }

            let done = end - processed;
            processed = end;
            batcher.observe(done, self.clock.now_ms().saturating_sub(batch_started));
            let failures = state.failures.clone();
            let bytes = state.bytes_copied;
            self.reporter.update(|status| {
                status.processed_keys = processed;
                status.bytes_copied = bytes;
                status.failed_keys = failures;
            });
            self.between_batches(state, &batcher)?;
        }
        info!(
            "copied {} of {} key(s) ({} byte(s)), {} unreadable",
            state.index.key_count(),
            keys.len(),
            state.bytes_copied,
            state.failures.len()
        );
        Ok(())
    }

    fn verify_copy(&self, state: &mut RunState) -> Result<()> {
        let keys: Vec<String> = state.index.keys().cloned().collect();
        let mut batcher = AdaptiveBatcher::new(self.config.batch.clone());
        let mut verified = 0;
        let mut verified_bytes = 0u64;
        while verified < keys.len() {
            let end = (verified + batcher.size()).min(keys.len());
            let batch_started = self.clock.now_ms();
            for key in &keys[verified..end] {
                let Some(expected) = state.index.get(key) else {
                    continue;
                };
                let found = match self
                    .retry
                    .run(self.clock.as_ref(), "read destination key", || {
                        self.destination.get(key)
                    }) {
                    Ok(found) => found,
                    Err(StorageError::Corrupt { reason, .. }) => {
                        warn!("cannot read back {key}: {reason}");
                        return Err(MigrationError::ChecksumMismatch {
                            key: key.clone(),
                            expected: expected.digest.clone(),
                            found: "<unreadable>".to_string(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                };
                match found {
                    Some(value) if expected.matches(&value) => {
                        verified_bytes += value.len() as u64;
                    }
                    other => {
                        return Err(MigrationError::ChecksumMismatch {
                            key: key.clone(),
                            expected: expected.digest.clone(),
                            found: other
                                .map(|value| checksum::compute(&value))
                                .unwrap_or_else(|| "<missing>".to_string()),
                        });
                    }
                }
            }

            let done = end - verified;
            verified = end;
            batcher.observe(done, self.clock.now_ms().saturating_sub(batch_started));
            self.reporter.update(|status| status.verified_keys = verified);
            self.between_batches(state, &batcher)?;
        }

        if verified != state.index.key_count() || verified_bytes != state.index.total_bytes() {
            return Err(MigrationError::SanityCheck(format!(
                "verified {verified} key(s) / {verified_bytes} byte(s), copied {} / {}",
                state.index.key_count(),
                state.index.total_bytes()
            )));
        }
        debug!("verified {verified} key(s)");
        Ok(())
    }

    /// Heartbeat, budget check and progress publication between batches.
    fn between_batches(&self, state: &mut RunState, batcher: &AdaptiveBatcher) -> Result<()> {
        self.heartbeat()?;
        let elapsed = self.clock.now_ms().saturating_sub(state.started_ms);
        if elapsed > self.config.run_budget_ms {
            state.budget_exceeded = true;
            return Err(MigrationError::Stuck {
                migration_id: self.config.migration_id.clone(),
                reason: format!(
                    "run exceeded its budget of {}ms",
                    self.config.run_budget_ms
                ),
            });
        }
        self.publish();
        let pause = batcher.yield_delay();
        if !pause.is_zero() {
            self.clock.sleep(pause);
        }
        Ok(())
    }

    fn heartbeat(&self) -> Result<()> {
        if self.lock.renew(&self.config.namespace, &self.holder_id)? {
            Ok(())
        } else {
            Err(MigrationError::LockLost {
                namespace: self.config.namespace.clone(),
            })
        }
    }

    /// Post-commit housekeeping. Problems are logged, never propagated: the
    /// migration is already complete. Returns whether everything was cleaned.
    fn clean_up(&self, snapshot_id: &str, index: &ChecksumIndex) -> bool {
        let mut clean = true;
        let mut cleared = 0usize;
        let clock = self.clock.as_ref();
        for expected in index.iter() {
            let key = &expected.key;
            match self
                .retry
                .run(clock, "re-read legacy key", || self.source.get(key))
            {
                Ok(Some(value)) if expected.matches(&value) => {
                    match self
                        .retry
                        .run(clock, "clear legacy key", || self.source.remove(key))
                    {
                        Ok(()) => cleared += 1,
                        Err(err) => {
                            warn!("could not clear legacy key {}: {err}", expected.key);
                            clean = false;
                        }
                    }
                }
                Ok(Some(_)) => {
                    warn!(
                        "legacy key {} changed after it was copied; leaving it",
                        expected.key
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("could not re-read legacy key {}: {err}", expected.key);
                    clean = false;
                }
            }
        }
        debug!("cleared {cleared} legacy key(s)");

        if clean {
            if let Err(err) = self.discard_index() {
                warn!("could not discard checksum index: {err}");
                clean = false;
            }
            if !snapshot_id.is_empty()
                && let Err(err) = self
                    .snapshots
                    .prune_snapshot(&self.config.namespace, snapshot_id)
            {
                warn!("could not prune snapshot {snapshot_id}: {err}");
                clean = false;
            }
        }
        self.release_lock();
        clean
    }

    /// Finish the cleanup of a committed run that was interrupted.
    fn resume_cleanup(&self, stored_version: u32) {
        let pending = match self.journal.latest() {
            Ok(Some(record))
                if record.version_to <= stored_version
                    && matches!(record.status, RecordStatus::Running | RecordStatus::Committed) =>
            {
                record
            }
            Ok(_) => return,
            Err(err) => {
                warn!("could not read migration journal: {err}");
                return;
            }
        };
        match self.lock.try_acquire(&self.config.namespace, &self.holder_id) {
            Ok(AcquireAttempt::Acquired(_)) => {}
            Ok(AcquireAttempt::Held(_) | AcquireAttempt::Collided) => {
                debug!("another context holds the lease; leaving cleanup to it");
                return;
            }
            Err(err) => {
                warn!("could not take the lease to resume cleanup: {err}");
                return;
            }
        }

        info!(
            "resuming cleanup of the run started at {}",
            pending.started_at_ms
        );
        self.reporter.set_phase(Phase::CleaningUp);
        let index = match self
            .retry
            .run(self.clock.as_ref(), "load checksum index", || {
                ChecksumIndex::load(self.destination.as_ref(), &self.config.migration_id)
            }) {
            Ok(index) => index.unwrap_or_default(),
            Err(err) => {
                warn!("could not load checksum index: {err}");
                self.release_lock();
                return;
            }
        };
        let snapshot_id = pending.snapshot_id.clone().unwrap_or_default();
        if self.clean_up(&snapshot_id, &index) {
            let mut record = pending;
            let status = if record.failed_keys.is_empty() {
                RecordStatus::Completed
            } else {
                RecordStatus::CompletedWithWarnings
            };
            if let Err(err) = self.journal.finish(&mut record, status) {
                warn!("could not journal completion: {err}");
            }
        }
    }

    /// Restore the destination (unless the lease was lost), record the failure
    /// and surface the error.
    fn fail(
        &self,
        err: MigrationError,
        record: &mut MigrationRecord,
        state: &RunState,
    ) -> MigrationError {
        let namespace = &self.config.namespace;
        let mut surfaced = err;

        if let MigrationError::LockLost { .. } = surfaced {
            error!("lease on {namespace:?} was lost mid-run; stopping without restoring");
        } else {
            let rollback =
                state.snapshot.is_some() && (surfaced.requires_rollback() || state.budget_exceeded);
            if rollback && let Some(snapshot) = &state.snapshot {
                self.reporter.set_phase(Phase::RollingBack);
                warn!("rolling back {namespace:?} to snapshot {}: {surfaced}", snapshot.id);
                match self.snapshots.restore_snapshot(snapshot) {
                    Ok(()) => {
                        if let Err(discard) = self.discard_index() {
                            warn!("could not discard checksum index: {discard}");
                        }
                    }
                    Err(restore_err) => {
                        error!("rollback failed: {restore_err}");
                        surfaced = MigrationError::RollbackFailed {
                            snapshot_id: snapshot.id.clone(),
                            reason: format!("{restore_err} (after: {surfaced})"),
                        };
                    }
                }
            }
            self.release_lock();
        }

        let reason = surfaced.to_string();
        record.error = Some(reason.clone());
        record.failed_keys = state.failures.iter().map(|f| f.key.clone()).collect();
        if let Err(journal_err) = self.journal.finish(record, RecordStatus::Failed) {
            warn!("could not journal failure: {journal_err}");
        }
        match self.limiter.record_failure(&reason) {
            Ok(attempts) => debug!(
                "{} consecutive failure(s) for {}",
                attempts.consecutive_failures, self.config.migration_id
            ),
            Err(limit_err) => warn!("could not record failed attempt: {limit_err}"),
        }
        if state.budget_exceeded
            && let Err(limit_err) = self.limiter.mark_stuck(&reason)
        {
            warn!("could not flag migration as stuck: {limit_err}");
        }

        let intact = !matches!(surfaced, MigrationError::RollbackFailed { .. });
        let failures = state.failures.clone();
        self.reporter.update(|status| {
            status.phase = Phase::Failed;
            status.failed_keys = failures;
            status.last_error = Some(if intact {
                format!("{reason}; original data intact")
            } else {
                reason.clone()
            });
        });
        self.publish();
        error!("migration {} failed: {reason}", self.config.migration_id);
        surfaced
    }

    /// Failure before any destination write: nothing to undo.
    fn fail_early(&self, err: MigrationError) -> MigrationError {
        let phase = match err {
            MigrationError::CoolingDown { .. } | MigrationError::Stuck { .. } => Phase::Idle,
            _ => Phase::Failed,
        };
        let reason = err.to_string();
        self.reporter.update(|status| {
            status.phase = phase;
            status.last_error = Some(reason);
        });
        err
    }

    fn enter(&self, phase: Phase) {
        self.reporter.set_phase(phase);
        self.publish();
    }

    fn publish(&self) {
        self.reporter.publish(
            self.destination.as_ref(),
            &self.retry,
            &self.config.namespace,
        );
    }

    fn discard_index(&self) -> std::result::Result<(), StorageError> {
        self.retry
            .run(self.clock.as_ref(), "discard checksum index", || {
                ChecksumIndex::discard(self.destination.as_ref(), &self.config.migration_id)
            })
    }

    fn release_lock(&self) {
        if let Err(err) = self.lock.release(&self.config.namespace, &self.holder_id) {
            warn!("could not release lease on {:?}: {err}", self.config.namespace);
        }
    }

    fn mirror(&self, published: &MigrationStatus) {
        self.reporter.update(|status| {
            status.phase = published.phase;
            status.processed_keys = published.processed_keys;
            status.total_keys = published.total_keys;
            status.verified_keys = published.verified_keys;
            status.bytes_copied = published.bytes_copied;
            status.failed_keys = published.failed_keys.clone();
            status.last_error = published.last_error.clone();
            status.holder_id = published.holder_id.clone();
        });
    }

    fn legacy_present(&self) -> Result<bool> {
        if let Some(probe) = &self.config.legacy_probe_key
            && self
                .retry
                .run(self.clock.as_ref(), "read legacy probe", || self.source.get(probe))?
                .is_some()
        {
            return Ok(true);
        }
        let keys = self.retry.run(self.clock.as_ref(), "list legacy keys", || {
            self.reserved.user_keys(self.source.as_ref(), &self.config.namespace)
        })?;
        Ok(!keys.is_empty())
    }
}

fn generate_holder_id() -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("ctx-{}-{}", std::process::id(), hex_encode(&suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryStore, keys};

    struct Fixture {
        legacy: Arc<MemoryStore>,
        dest: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                legacy: Arc::new(MemoryStore::from_pairs(pairs.iter().copied())),
                dest: Arc::new(MemoryStore::new("dest")),
                clock: Arc::new(ManualClock::new(1_700_000_000_000)),
            }
        }

        fn coordinator(&self, holder: &str) -> MigrationCoordinator {
            MigrationCoordinator::new(
                self.legacy.clone(),
                self.dest.clone(),
                self.clock.clone(),
                MigrationConfig::default(),
            )
            .unwrap()
            .with_holder_id(holder)
        }
    }

    #[test]
    fn test_fresh_install_stamps_marker_without_copying() {
        let fx = Fixture::new(&[]);
        let outcome = fx.coordinator("tab-a").start_migration().unwrap();
        assert_eq!(outcome, MigrationOutcome::FreshInstall { version: 2 });
        assert!(fx.dest.get(&keys::version_marker()).unwrap().is_some());
        assert!(fx.dest.get(&keys::lock("")).unwrap().is_none());
    }

    #[test]
    fn test_migrates_and_clears_legacy() {
        let fx = Fixture::new(&[("a", "1"), ("b", "22")]);
        let coordinator = fx.coordinator("tab-a");
        let MigrationOutcome::Completed(report) = coordinator.start_migration().unwrap() else {
            panic!("expected a completed migration");
        };
        assert_eq!(report.copied_keys, 2);
        assert_eq!(report.bytes_copied, 3);
        assert_eq!(fx.dest.get("b").unwrap().as_deref(), Some("22"));
        assert!(fx.legacy.is_empty());
        assert_eq!(coordinator.status().phase, Phase::Completed);
        assert!(coordinator.snapshots().list_snapshots(None).unwrap().is_empty());
        assert_eq!(coordinator.history().unwrap()[0].status, RecordStatus::Completed);
        assert!(coordinator.current_lock().unwrap().is_none());
    }

    #[test]
    fn test_second_start_is_noop() {
        let fx = Fixture::new(&[("a", "1")]);
        fx.coordinator("tab-a").start_migration().unwrap();
        fx.legacy.set("late", "x").unwrap();
        let outcome = fx.coordinator("tab-b").start_migration().unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyCurrent { version: 2 });
        assert_eq!(fx.dest.get("late").unwrap(), None);
    }

    #[test]
    fn test_live_lease_defers() {
        let fx = Fixture::new(&[("a", "1")]);
        let other = LeaseLock::new(
            fx.dest.clone(),
            fx.clock.clone(),
            RetryPolicy::none(),
            Default::default(),
        );
        other.acquire("", "tab-a").unwrap();

        let coordinator = fx.coordinator("tab-b");
        let outcome = coordinator.start_migration().unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Deferred {
                holder: "tab-a".into()
            }
        );
        let status = coordinator.status();
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.deferred_to.as_deref(), Some("tab-a"));
        assert_eq!(fx.legacy.len(), 1);
    }

    #[test]
    fn test_version_gap_is_refused() {
        let fx = Fixture::new(&[("a", "1")]);
        fx.dest
            .set(&keys::version_marker(), r#"{"version":0}"#)
            .unwrap();
        let err = fx.coordinator("tab-a").start_migration().unwrap_err();
        assert!(matches!(err, MigrationError::VersionGap { found: 0, target: 2 }));
        assert_eq!(fx.dest.get("a").unwrap(), None);
    }

    #[test]
    fn test_failure_policy_thresholds() {
        let policy = FailurePolicy::default();
        assert!(!policy.exceeded(0, 0));
        assert!(!policy.exceeded(1, 10_000));
        assert!(policy.exceeded(1, 10));
        let capped = FailurePolicy {
            max_failed_ratio: 1.0,
            max_failed_keys: Some(2),
        };
        assert!(capped.exceeded(3, 10));
    }

    #[test]
    fn test_resolve_stuck_clears_flag() {
        let fx = Fixture::new(&[("a", "1")]);
        let coordinator = fx.coordinator("tab-a");
        let limiter = RateLimiter::new(
            fx.dest.clone(),
            fx.clock.clone(),
            RetryPolicy::none(),
            Default::default(),
            "legacy-to-dir",
        );
        limiter.mark_stuck("manual").unwrap();
        assert!(matches!(
            coordinator.start_migration(),
            Err(MigrationError::Stuck { .. })
        ));
        assert!(coordinator.resolve_stuck().unwrap());
        assert!(matches!(
            coordinator.start_migration().unwrap(),
            MigrationOutcome::Completed(_)
        ));
    }
}
