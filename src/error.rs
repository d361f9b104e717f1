use std::io;
use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                StorageError::QuotaExceeded(err.to_string())
            }
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::ReadOnlyFilesystem
            | io::ErrorKind::InvalidFilename => {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("lock on {namespace} is held by {holder}")]
    LockContention { namespace: String, holder: String },
    #[error("lock on {namespace} was taken over while migrating")]
    LockLost { namespace: String },
    #[error("checksum mismatch for {key}: expected {expected}, found {found}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        found: String,
    },
    #[error("corrupt source value at {key}: {reason}")]
    CorruptSourceValue { key: String, reason: String },
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("stored version {found} cannot advance to {target} without skipping")]
    VersionGap { found: u32, target: u32 },
    #[error("migration {migration_id} is cooling down until {retry_at_ms} ms")]
    CoolingDown {
        migration_id: String,
        retry_at_ms: u64,
    },
    #[error("migration {migration_id} is stuck and needs manual resolution: {reason}")]
    Stuck {
        migration_id: String,
        reason: String,
    },
    #[error("sanity check failed: {0}")]
    SanityCheck(String),
    #[error("{failed} of {total} keys failed, above the allowed threshold")]
    FailureThresholdExceeded { failed: usize, total: usize },
    #[error("snapshot {0} not found")]
    SnapshotMissing(String),
    #[error("rollback failed ({reason}); snapshot {snapshot_id} is retained for manual recovery")]
    RollbackFailed { snapshot_id: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    /// Errors that leave the run eligible for a later retry without any user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::TransientIo(_)
                | MigrationError::LockContention { .. }
                | MigrationError::CoolingDown { .. }
                | MigrationError::ChecksumMismatch { .. }
                | MigrationError::SanityCheck(_)
        )
    }

    /// Namespace-level failures that must restore the destination before surfacing.
    ///
    /// Unreadable legacy keys are collected per key while copying and never
    /// reach this check, so a corrupt read surfacing here came from the
    /// destination and rolls back like any other.
    pub fn requires_rollback(&self) -> bool {
        !matches!(
            self,
            MigrationError::LockContention { .. }
                | MigrationError::LockLost { .. }
                | MigrationError::CoolingDown { .. }
                | MigrationError::Stuck { .. }
                | MigrationError::VersionGap { .. }
                | MigrationError::InvalidConfig(_)
        )
    }
}

impl From<StorageError> for MigrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => MigrationError::TransientIo(msg),
            StorageError::QuotaExceeded(msg) => MigrationError::QuotaExceeded(msg),
            StorageError::Unavailable(msg) => MigrationError::BackendUnavailable(msg),
            StorageError::Corrupt { key, reason } => {
                MigrationError::CorruptSourceValue { key, reason }
            }
        }
    }
}

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
