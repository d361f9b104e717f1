use log::warn;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::retry::RetryPolicy;
use crate::storage::{StorageAdapter, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    VersionCheck,
    AcquiringLock,
    Snapshotting,
    Copying,
    Verifying,
    Committing,
    CleaningUp,
    Completed,
    CompletedWithWarnings,
    RollingBack,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::CompletedWithWarnings | Phase::Failed
        )
    }

    /// Phases in which the holder is mutating the destination.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Phase::Idle
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::VersionCheck => "version_check",
            Phase::AcquiringLock => "acquiring_lock",
            Phase::Snapshotting => "snapshotting",
            Phase::Copying => "copying",
            Phase::Verifying => "verifying",
            Phase::Committing => "committing",
            Phase::CleaningUp => "cleaning_up",
            Phase::Completed => "completed",
            Phase::CompletedWithWarnings => "completed_with_warnings",
            Phase::RollingBack => "rolling_back",
            Phase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationStatus {
    pub phase: Phase,
    pub processed_keys: usize,
    pub total_keys: usize,
    pub verified_keys: usize,
    pub bytes_copied: u64,
    pub failed_keys: Vec<KeyFailure>,
    pub last_error: Option<String>,
    /// Context running the migration, when known.
    pub holder_id: Option<String>,
    /// Set when this context deferred to another holder.
    pub deferred_to: Option<String>,
    pub updated_at_ms: u64,
}

impl MigrationStatus {
    pub fn percent(&self) -> f64 {
        if self.total_keys == 0 {
            return if self.phase.is_terminal() { 100.0 } else { 0.0 };
        }
        (self.processed_keys as f64 / self.total_keys as f64 * 100.0).min(100.0)
    }
}

/// Notified after every status change.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, status: &MigrationStatus);
}

impl<F> StatusObserver for F
where
    F: Fn(&MigrationStatus) + Send + Sync,
{
    fn on_status(&self, status: &MigrationStatus) {
        self(status)
    }
}

/// Owns the live status of one coordinator and fans changes out to observers.
pub struct StatusReporter {
    clock: Arc<dyn Clock>,
    status: RwLock<MigrationStatus>,
    observers: Mutex<Vec<Arc<dyn StatusObserver>>>,
}

impl StatusReporter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let status = MigrationStatus {
            updated_at_ms: clock.now_ms(),
            ..MigrationStatus::default()
        };
        Self {
            clock,
            status: RwLock::new(status),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> MigrationStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn update(&self, apply: impl FnOnce(&mut MigrationStatus)) -> MigrationStatus {
        let snapshot = {
            let mut status = self.status.write();
            apply(&mut status);
            status.updated_at_ms = self.clock.now_ms();
            status.clone()
        };
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_status(&snapshot);
        }
        snapshot
    }

    pub fn set_phase(&self, phase: Phase) -> MigrationStatus {
        self.update(|status| status.phase = phase)
    }

    /// Start a fresh run, keeping only the holder id.
    pub fn reset(&self, holder_id: &str) {
        self.update(|status| {
            *status = MigrationStatus {
                holder_id: Some(holder_id.to_string()),
                ..MigrationStatus::default()
            };
        });
    }

    /// Write the current status where other contexts can read it.
    /// Publishing is advisory: a failed write only logs.
    pub fn publish(&self, store: &dyn StorageAdapter, retry: &RetryPolicy, namespace: &str) {
        let status = self.current();
        let payload = match serde_json::to_string(&status) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not encode progress: {err}");
                return;
            }
        };
        let key = keys::progress(namespace);
        if let Err(err) = retry.run(self.clock.as_ref(), "publish progress", || {
            store.set(&key, &payload)
        }) {
            warn!("could not publish progress for {namespace:?}: {err}");
        }
    }
}

/// Progress last published by whichever context ran the migration.
pub fn read_published(store: &dyn StorageAdapter, namespace: &str) -> Option<MigrationStatus> {
    let raw = store.get(&keys::progress(namespace)).ok()??;
    serde_json::from_str(&raw).ok()
}
