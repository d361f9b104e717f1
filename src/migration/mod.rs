//! The migration engine.
//!
//! - `checksum`: per-key digests and the aggregate index used for verification
//! - `lock`: lease-based mutual exclusion through shared storage
//! - `snapshot`: rollback baselines of the destination namespace
//! - `rate_limit`: cooldowns and the stuck flag across runs
//! - `coordinator`: the state machine tying them together

pub mod batch;
pub mod checksum;
pub mod coordinator;
pub mod journal;
pub mod lock;
pub mod marker;
pub mod rate_limit;
pub mod snapshot;
pub mod status;

pub use batch::{AdaptiveBatcher, BatchSettings};
pub use checksum::{ChecksumIndex, KeyChecksum};
pub use coordinator::{FailurePolicy, MigrationCoordinator, MigrationOutcome, MigrationReport};
pub use journal::{MigrationJournal, MigrationRecord, RecordStatus};
pub use lock::{LeaseLock, LockRecord, LockSettings};
pub use marker::{VersionMarker, VersionPlan};
pub use rate_limit::{AttemptDecision, AttemptRecord, RateLimitPolicy, RateLimiter};
pub use snapshot::{Snapshot, SnapshotManager, SnapshotSummary};
pub use status::{KeyFailure, MigrationStatus, Phase, StatusObserver, StatusReporter};
