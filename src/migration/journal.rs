use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::storage::{StorageAdapter, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Copy in progress (or interrupted before commit)
    Running,
    /// Marker written, cleanup not finished
    Committed,
    Completed,
    CompletedWithWarnings,
    /// Rolled back; the snapshot is kept until resolved
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordStatus::Completed | RecordStatus::CompletedWithWarnings | RecordStatus::Failed
        )
    }
}

/// One run of a migration, persisted alongside the data it moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub version_from: u32,
    pub version_to: u32,
    pub holder_id: String,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub status: RecordStatus,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub copied_keys: usize,
    #[serde(default)]
    pub failed_keys: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// History of runs for one migration id, oldest first.
pub struct MigrationJournal {
    store: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    migration_id: String,
}

impl MigrationJournal {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        migration_id: &str,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            migration_id: migration_id.to_string(),
        }
    }

    pub fn begin(&self, version_from: u32, version_to: u32, holder_id: &str) -> Result<MigrationRecord> {
        let record = MigrationRecord {
            migration_id: self.migration_id.clone(),
            version_from,
            version_to,
            holder_id: holder_id.to_string(),
            started_at_ms: self.clock.now_ms(),
            completed_at_ms: None,
            status: RecordStatus::Running,
            snapshot_id: None,
            copied_keys: 0,
            failed_keys: Vec::new(),
            error: None,
        };
        self.save(&record)?;
        Ok(record)
    }

    pub fn save(&self, record: &MigrationRecord) -> Result<()> {
        let key = keys::journal(&record.migration_id, record.started_at_ms);
        let payload = serde_json::to_string(record)?;
        self.retry
            .run(self.clock.as_ref(), "write journal", || self.store.set(&key, &payload))?;
        Ok(())
    }

    /// Stamp a terminal status and completion time.
    pub fn finish(&self, record: &mut MigrationRecord, status: RecordStatus) -> Result<()> {
        record.status = status;
        record.completed_at_ms = Some(self.clock.now_ms());
        self.save(record)
    }

    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        let prefix = keys::journal_prefix(&self.migration_id);
        let storage_keys = self.retry.run(self.clock.as_ref(), "list journal", || {
            self.store.list_keys(Some(&prefix))
        })?;
        let mut records = Vec::new();
        for key in storage_keys {
            let raw = self
                .retry
                .run(self.clock.as_ref(), "read journal", || self.store.get(&key))?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<MigrationRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping unreadable journal entry {key}: {err}"),
            }
        }
        records.sort_by_key(|r| r.started_at_ms);
        Ok(records)
    }

    pub fn latest(&self) -> Result<Option<MigrationRecord>> {
        Ok(self.list()?.pop())
    }

    /// Most recent run that never reached a terminal status or failed with its
    /// snapshot still retained.
    pub fn unresolved(&self) -> Result<Option<MigrationRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .rev()
            .find(|r| !r.status.is_terminal() || r.status == RecordStatus::Failed))
    }
}
