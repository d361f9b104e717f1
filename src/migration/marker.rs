use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::{Clock, to_rfc3339};
use crate::error::{MigrationError, Result};
use crate::retry::RetryPolicy;
use crate::storage::{StorageAdapter, keys};

/// Persisted form of the version marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerValue {
    pub version: u32,
    #[serde(default)]
    pub committed_at: Option<String>,
}

/// What the stored marker says about the work left to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPlan {
    /// The store already satisfies the target.
    AlreadyCurrent { version: u32 },
    /// Nothing stored anywhere: stamp the target without copying.
    FreshInstall,
    /// Copy legacy data and advance `from -> to`.
    Migrate { from: u32, to: u32 },
}

/// Decide the plan for `target` from the stored marker and whether the legacy
/// backend holds data. The marker only ever advances by one step.
pub fn plan(stored: Option<u32>, target: u32, legacy_present: bool) -> Result<VersionPlan> {
    match stored {
        Some(version) if version >= target => Ok(VersionPlan::AlreadyCurrent { version }),
        Some(version) if version + 1 == target => Ok(VersionPlan::Migrate {
            from: version,
            to: target,
        }),
        Some(version) => Err(MigrationError::VersionGap {
            found: version,
            target,
        }),
        None if legacy_present => Ok(VersionPlan::Migrate {
            from: target.saturating_sub(1),
            to: target,
        }),
        None => Ok(VersionPlan::FreshInstall),
    }
}

/// The single key whose write makes a migration observably complete.
pub struct VersionMarker {
    store: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl VersionMarker {
    pub fn new(store: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Stored version; a bare integer is accepted for hand-written markers.
    pub fn read(&self) -> Result<Option<u32>> {
        let key = keys::version_marker();
        let raw = self
            .retry
            .run(self.clock.as_ref(), "read version marker", || self.store.get(&key))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        if let Ok(version) = raw.trim().parse::<u32>() {
            return Ok(Some(version));
        }
        let value: MarkerValue = serde_json::from_str(&raw)?;
        Ok(Some(value.version))
    }

    /// Write `version`. Refuses to move the marker backwards.
    pub fn write(&self, version: u32) -> Result<()> {
        if let Some(current) = self.read()?
            && current > version
        {
            return Err(MigrationError::VersionGap {
                found: current,
                target: version,
            });
        }
        let value = MarkerValue {
            version,
            committed_at: Some(to_rfc3339(self.clock.now_ms())),
        };
        let payload = serde_json::to_string(&value)?;
        let key = keys::version_marker();
        self.retry
            .run(self.clock.as_ref(), "write version marker", || {
                self.store.set(&key, &payload)
            })?;
        Ok(())
    }
}
