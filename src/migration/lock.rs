//! Lease-based mutual exclusion through shared storage.
//!
//! The backend offers no compare-and-swap, so acquisition is a timed
//! double-check: write a tentative record carrying a random nonce, wait the
//! settle delay, and re-read. A contender whose write landed later overwrites
//! ours and we observe a foreign nonce. This is sound as long as the settle
//! delay exceeds the longest gap between a contender's "lock is free" read and
//! its tentative write.

use log::{debug, info};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{MigrationError, Result, StorageError};
use crate::retry::{RetryPolicy, jittered};
use crate::storage::{StorageAdapter, hex_encode, keys};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub acquired_at_ms: u64,
    #[serde(default)]
    pub renewed_at_ms: u64,
    pub ttl_ms: u64,
    #[serde(default)]
    pub nonce: String,
}

impl LockRecord {
    pub fn expires_at_ms(&self) -> u64 {
        self.acquired_at_ms
            .max(self.renewed_at_ms)
            .saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub ttl_ms: u64,
    /// Pause between the tentative write and the confirming re-read.
    pub settle_delay_ms: u64,
    /// Give up acquiring after this long and defer to the holder.
    pub max_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_fraction: f64,
    /// Interval at which non-holders poll for release or completion.
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            settle_delay_ms: 150,
            max_wait_ms: 5_000,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_fraction: 0.5,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireAttempt {
    Acquired(LockRecord),
    /// A live lease belongs to someone else.
    Held(LockRecord),
    /// Our tentative record was overwritten by a racing writer.
    Collided,
}

pub struct LeaseLock {
    store: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    settings: LockSettings,
}

impl LeaseLock {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        settings: LockSettings,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            settings,
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    fn read(&self, namespace: &str) -> std::result::Result<Option<LockRecord>, StorageError> {
        let key = keys::lock(namespace);
        let raw = self
            .retry
            .run(self.clock.as_ref(), "read lock", || self.store.get(&key))?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                // An unreadable record cannot protect anything; treat the lock as free.
                log::warn!("discarding malformed lock record for {namespace}: {err}");
                None
            }
        }))
    }

    fn write(&self, namespace: &str, record: &LockRecord) -> std::result::Result<(), StorageError> {
        let key = keys::lock(namespace);
        let payload = serde_json::to_string(record)
            .map_err(|err| StorageError::Transient(format!("serialize lock: {err}")))?;
        self.retry
            .run(self.clock.as_ref(), "write lock", || self.store.set(&key, &payload))
    }

    /// Live lease for `namespace`, if any.
    pub fn current(&self, namespace: &str) -> Result<Option<LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self.read(namespace)?.filter(|record| !record.is_expired(now)))
    }

    /// One acquisition round: check, tentative write, settle, confirm.
    pub fn try_acquire(&self, namespace: &str, holder_id: &str) -> Result<AcquireAttempt> {
        let now = self.clock.now_ms();
        if let Some(existing) = self.read(namespace)?
            && !existing.is_expired(now)
            && existing.holder_id != holder_id
        {
            return Ok(AcquireAttempt::Held(existing));
        }

        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let tentative = LockRecord {
            holder_id: holder_id.to_string(),
            acquired_at_ms: now,
            renewed_at_ms: now,
            ttl_ms: self.settings.ttl_ms,
            nonce: hex_encode(&nonce),
        };
        self.write(namespace, &tentative)?;

        self.clock
            .sleep(Duration::from_millis(self.settings.settle_delay_ms));

        match self.read(namespace)? {
            Some(confirmed) if confirmed == tentative => Ok(AcquireAttempt::Acquired(confirmed)),
            Some(other) if other.holder_id != holder_id => {
                debug!("lock on {namespace}: lost race to {}", other.holder_id);
                Ok(AcquireAttempt::Collided)
            }
            _ => Ok(AcquireAttempt::Collided),
        }
    }

    /// Acquire with jittered backoff, deferring with `LockContention` after `max_wait_ms`.
    pub fn acquire(&self, namespace: &str, holder_id: &str) -> Result<LockRecord> {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(self.settings.max_wait_ms);
        let mut round: u32 = 0;
        loop {
            let holder = match self.try_acquire(namespace, holder_id)? {
                AcquireAttempt::Acquired(record) => {
                    info!("lock on {namespace} acquired by {holder_id}");
                    return Ok(record);
                }
                AcquireAttempt::Held(record) => record.holder_id,
                AcquireAttempt::Collided => "a racing context".to_string(),
            };
            if self.clock.now_ms() >= deadline {
                return Err(MigrationError::LockContention {
                    namespace: namespace.to_string(),
                    holder,
                });
            }
            round = round.saturating_add(1);
            let delay = self.backoff(round);
            debug!(
                "lock on {namespace} busy ({holder}); retrying in {}ms",
                delay.as_millis()
            );
            self.clock.sleep(delay);
        }
    }

    fn backoff(&self, round: u32) -> Duration {
        let factor = 1u64 << round.saturating_sub(1).min(16);
        let raw = self
            .settings
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.settings.backoff_max_ms.max(self.settings.backoff_base_ms));
        jittered(Duration::from_millis(raw), self.settings.jitter_fraction)
    }

    /// Extend our lease. Returns `false` when another holder owns it now.
    pub fn renew(&self, namespace: &str, holder_id: &str) -> Result<bool> {
        match self.read(namespace)? {
            Some(mut record) if record.holder_id == holder_id => {
                record.renewed_at_ms = self.clock.now_ms();
                self.write(namespace, &record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete the lease if `holder_id` owns it.
    pub fn release(&self, namespace: &str, holder_id: &str) -> Result<bool> {
        match self.read(namespace)? {
            Some(record) if record.holder_id == holder_id => {
                let key = keys::lock(namespace);
                self.retry
                    .run(self.clock.as_ref(), "release lock", || self.store.remove(&key))?;
                info!("lock on {namespace} released by {holder_id}");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Poll until the lease is released or expires. Returns `false` on timeout.
    pub fn wait_for_release(
        &self,
        namespace: &str,
        max_wait: Duration,
        mut on_poll: impl FnMut(&LockRecord),
    ) -> Result<bool> {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(max_wait.as_millis() as u64);
        loop {
            match self.current(namespace)? {
                None => return Ok(true),
                Some(record) => on_poll(&record),
            }
            if self.clock.now_ms() >= deadline {
                return Ok(false);
            }
            self.clock
                .sleep(Duration::from_millis(self.settings.poll_interval_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::storage::MemoryStore;
    use std::sync::Barrier;
    use std::thread;

    fn lock_on(store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> LeaseLock {
        LeaseLock::new(store, clock, RetryPolicy::none(), LockSettings::default())
    }

    #[test]
    fn test_acquire_and_release() {
        let store = Arc::new(MemoryStore::new("dest"));
        let lock = lock_on(store.clone(), Arc::new(ManualClock::new(0)));

        let record = lock.acquire("app/", "tab-a").unwrap();
        assert_eq!(record.holder_id, "tab-a");
        assert_eq!(lock.current("app/").unwrap(), Some(record));

        assert!(!lock.release("app/", "tab-b").unwrap());
        assert!(lock.release("app/", "tab-a").unwrap());
        assert_eq!(lock.current("app/").unwrap(), None);
    }

    #[test]
    fn test_live_foreign_lease_defers() {
        let store = Arc::new(MemoryStore::new("dest"));
        let clock = Arc::new(ManualClock::new(0));
        let lock = lock_on(store, clock);
        lock.acquire("app/", "tab-a").unwrap();

        match lock.acquire("app/", "tab-b") {
            Err(MigrationError::LockContention { holder, .. }) => assert_eq!(holder, "tab-a"),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = Arc::new(MemoryStore::new("dest"));
        let clock = Arc::new(ManualClock::new(0));
        let lock = lock_on(store, clock.clone());
        lock.acquire("app/", "crashed-tab").unwrap();

        clock.advance(Duration::from_millis(LockSettings::default().ttl_ms + 1));
        let record = lock.acquire("app/", "tab-b").unwrap();
        assert_eq!(record.holder_id, "tab-b");
    }

    #[test]
    fn test_overwritten_tentative_record_collides() {
        let store = Arc::new(MemoryStore::new("dest"));
        let clock = Arc::new(ManualClock::new(0));
        let lock = lock_on(store.clone(), clock.clone());

        // A racing writer lands between our write and our confirming read.
        let racer = LockRecord {
            holder_id: "tab-b".into(),
            acquired_at_ms: 0,
            renewed_at_ms: 0,
            ttl_ms: 30_000,
            nonce: "ff".into(),
        };
        let racing = RacingStore {
            inner: store,
            racer: serde_json::to_string(&racer).unwrap(),
        };
        let lock = LeaseLock::new(
            Arc::new(racing),
            clock,
            RetryPolicy::none(),
            lock.settings().clone(),
        );
        assert_eq!(lock.try_acquire("app/", "tab-a").unwrap(), AcquireAttempt::Collided);
    }

    struct RacingStore {
        inner: Arc<MemoryStore>,
        racer: String,
    }

    impl StorageAdapter for RacingStore {
        fn name(&self) -> &str {
            "racing"
        }
        fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, _value: &str) -> std::result::Result<(), StorageError> {
            self.inner.set(key, &self.racer)
        }
        fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
            self.inner.remove(key)
        }
        fn list_keys(&self, prefix: Option<&str>) -> std::result::Result<Vec<String>, StorageError> {
            self.inner.list_keys(prefix)
        }
    }

    #[test]
    fn test_renew_extends_only_own_lease() {
        let store = Arc::new(MemoryStore::new("dest"));
        let clock = Arc::new(ManualClock::new(0));
        let lock = lock_on(store, clock.clone());
        let record = lock.acquire("app/", "tab-a").unwrap();

        clock.advance(Duration::from_millis(20_000));
        assert!(lock.renew("app/", "tab-a").unwrap());
        assert!(!lock.renew("app/", "tab-b").unwrap());
        let renewed = lock.current("app/").unwrap().unwrap();
        assert!(renewed.expires_at_ms() > record.expires_at_ms());
    }

    #[test]
    fn test_wait_for_release_times_out_then_sees_expiry() {
        let store = Arc::new(MemoryStore::new("dest"));
        let clock = Arc::new(ManualClock::new(0));
        let lock = lock_on(store, clock);
        lock.acquire("app/", "tab-a").unwrap();

        let mut polls = 0;
        assert!(!lock
            .wait_for_release("app/", Duration::from_millis(1_000), |_| polls += 1)
            .unwrap());
        assert!(polls > 1);
        assert!(lock
            .wait_for_release("app/", Duration::from_secs(60), |_| {})
            .unwrap());
    }

    #[test]
    fn test_concurrent_requests_never_both_succeed() {
        for _ in 0..5 {
            let store = Arc::new(MemoryStore::new("dest"));
            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let settings = LockSettings {
                settle_delay_ms: 30,
                max_wait_ms: 0,
                ..LockSettings::default()
            };
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["tab-a", "tab-b"]
                .into_iter()
                .map(|holder| {
                    let lock = LeaseLock::new(
                        store.clone(),
                        clock.clone(),
                        RetryPolicy::none(),
                        settings.clone(),
                    );
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        lock.acquire("app/", holder).is_ok()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1, "exactly one context must hold the lease");
        }
    }
}
