//! Moves a local-first application's persisted state from a legacy key-value
//! backend to a more robust one, exactly once, without losing data, even when
//! several contexts start the migration at the same time.

pub mod clock;
pub mod config;
pub mod error;
pub mod migration;
pub mod paths;
pub mod retry;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MigrationConfig;
pub use error::{MigrationError, Result, StorageError};
pub use migration::{MigrationCoordinator, MigrationOutcome, MigrationStatus, Phase};
pub use storage::StorageAdapter;
