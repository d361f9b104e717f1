use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{MigrationError, Result};
use crate::retry::RetryPolicy;
use crate::storage::{StorageAdapter, keys};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Consecutive failures tolerated before any cooldown applies.
    pub failure_threshold: u32,
    /// Cooldowns applied after the threshold, the last entry repeating.
    pub backoff_schedule_ms: Vec<u64>,
    /// Consecutive failures after which the migration is flagged stuck.
    pub max_attempts: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_schedule_ms: vec![60_000, 300_000, 1_800_000],
            max_attempts: 6,
        }
    }
}

impl RateLimitPolicy {
    pub fn cooldown_ms(&self, consecutive_failures: u32) -> u64 {
        if consecutive_failures < self.failure_threshold || self.backoff_schedule_ms.is_empty() {
            return 0;
        }
        let step = (consecutive_failures - self.failure_threshold) as usize;
        let last = self.backoff_schedule_ms.len() - 1;
        self.backoff_schedule_ms[step.min(last)]
    }
}

/// Attempt bookkeeping persisted in the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub last_attempt_ms: Option<u64>,
    pub last_failure_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    pub last_error: Option<String>,
    pub stuck: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    Allowed,
    CoolingDown { retry_at_ms: u64 },
    Stuck { reason: String },
}

/// Cooldown guard for one migration id.
pub struct RateLimiter {
    store: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    policy: RateLimitPolicy,
    migration_id: String,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        policy: RateLimitPolicy,
        migration_id: &str,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            policy,
            migration_id: migration_id.to_string(),
        }
    }

    pub fn record(&self) -> Result<AttemptRecord> {
        let key = keys::attempts(&self.migration_id);
        let raw = self
            .retry
            .run(self.clock.as_ref(), "read attempt record", || self.store.get(&key))?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(AttemptRecord::default()),
        }
    }

    fn save(&self, record: &AttemptRecord) -> Result<()> {
        let key = keys::attempts(&self.migration_id);
        let payload = serde_json::to_string(record)?;
        self.retry
            .run(self.clock.as_ref(), "write attempt record", || {
                self.store.set(&key, &payload)
            })?;
        Ok(())
    }

    pub fn check(&self) -> Result<AttemptDecision> {
        let record = self.record()?;
        if let Some(reason) = record.stuck {
            return Ok(AttemptDecision::Stuck { reason });
        }
        let cooldown = self.policy.cooldown_ms(record.consecutive_failures);
        if let Some(failed_at) = record.last_failure_ms
            && cooldown > 0
        {
            let retry_at_ms = failed_at.saturating_add(cooldown);
            if self.clock.now_ms() < retry_at_ms {
                return Ok(AttemptDecision::CoolingDown { retry_at_ms });
            }
        }
        Ok(AttemptDecision::Allowed)
    }

    pub fn can_attempt(&self) -> Result<bool> {
        Ok(self.check()? == AttemptDecision::Allowed)
    }

    /// Error form of [`check`](Self::check) for callers that must not proceed.
    pub fn ensure_allowed(&self) -> Result<()> {
        match self.check()? {
            AttemptDecision::Allowed => Ok(()),
            AttemptDecision::CoolingDown { retry_at_ms } => Err(MigrationError::CoolingDown {
                migration_id: self.migration_id.clone(),
                retry_at_ms,
            }),
            AttemptDecision::Stuck { reason } => Err(MigrationError::Stuck {
                migration_id: self.migration_id.clone(),
                reason,
            }),
        }
    }

    pub fn record_attempt(&self) -> Result<()> {
        let mut record = self.record()?;
        record.last_attempt_ms = Some(self.clock.now_ms());
        record.total_attempts = record.total_attempts.saturating_add(1);
        self.save(&record)
    }

    pub fn record_failure(&self, reason: &str) -> Result<AttemptRecord> {
        let mut record = self.record()?;
        record.last_failure_ms = Some(self.clock.now_ms());
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_error = Some(reason.to_string());
        if record.consecutive_failures >= self.policy.max_attempts && record.stuck.is_none() {
            warn!(
                "migration {} failed {} times in a row; flagging as stuck",
                self.migration_id, record.consecutive_failures
            );
            record.stuck = Some(format!(
                "{} consecutive failures, last: {reason}",
                record.consecutive_failures
            ));
        }
        self.save(&record)?;
        Ok(record)
    }

    pub fn record_success(&self) -> Result<()> {
        let mut record = self.record()?;
        record.consecutive_failures = 0;
        record.last_failure_ms = None;
        record.last_error = None;
        record.stuck = None;
        self.save(&record)
    }

    pub fn mark_stuck(&self, reason: &str) -> Result<()> {
        let mut record = self.record()?;
        record.stuck = Some(reason.to_string());
        self.save(&record)
    }

    /// Clear the stuck flag and failure streak after manual intervention.
    pub fn resolve(&self) -> Result<bool> {
        let mut record = self.record()?;
        let was_blocked = record.stuck.is_some() || record.consecutive_failures > 0;
        record.stuck = None;
        record.consecutive_failures = 0;
        record.last_failure_ms = None;
        self.save(&record)?;
        if was_blocked {
            info!("migration {} manually resolved", self.migration_id);
        }
        Ok(was_blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new("dest")),
            clock,
            RetryPolicy::none(),
            RateLimitPolicy::default(),
            "legacy-to-dir",
        )
    }

    #[test]
    fn test_cooldown_schedule_is_capped() {
        let policy = RateLimitPolicy::default();
        assert_eq!(policy.cooldown_ms(2), 0);
        assert_eq!(policy.cooldown_ms(3), 60_000);
        assert_eq!(policy.cooldown_ms(4), 300_000);
        assert_eq!(policy.cooldown_ms(5), 1_800_000);
        assert_eq!(policy.cooldown_ms(9), 1_800_000);
    }

    #[test]
    fn test_fourth_attempt_blocked_for_a_minute() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = limiter(clock.clone());
        for _ in 0..3 {
            assert!(limiter.can_attempt().unwrap());
            limiter.record_attempt().unwrap();
            limiter.record_failure("boom").unwrap();
        }
        assert_eq!(
            limiter.check().unwrap(),
            AttemptDecision::CoolingDown {
                retry_at_ms: 1_060_000
            }
        );
        clock.advance(Duration::from_millis(59_999));
        assert!(!limiter.can_attempt().unwrap());
        clock.advance(Duration::from_millis(1));
        assert!(limiter.can_attempt().unwrap());
    }

    #[test]
    fn test_failures_below_threshold_do_not_block() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);
        limiter.record_failure("one").unwrap();
        limiter.record_failure("two").unwrap();
        assert!(limiter.can_attempt().unwrap());
    }

    #[test]
    fn test_max_attempts_flags_stuck_until_resolved() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        for _ in 0..6 {
            limiter.record_failure("quota").unwrap();
        }
        clock.advance(Duration::from_secs(24 * 3600));
        assert!(matches!(
            limiter.ensure_allowed(),
            Err(MigrationError::Stuck { .. })
        ));

        assert!(limiter.resolve().unwrap());
        assert!(limiter.can_attempt().unwrap());
    }

    #[test]
    fn test_success_resets_streak() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);
        for _ in 0..3 {
            limiter.record_failure("x").unwrap();
        }
        limiter.record_success().unwrap();
        let record = limiter.record().unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(limiter.can_attempt().unwrap());
    }
}
