#![allow(dead_code)]

use parking_lot::Mutex;
use rehome::migration::LockRecord;
use rehome::storage::{MemoryStore, StorageAdapter, keys};
use rehome::{MigrationConfig, StorageError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Memory-backed adapter with switchable faults.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    unreadable: Mutex<HashSet<String>>,
    tampered: Mutex<HashSet<String>>,
    blips: Mutex<HashSet<String>>,
    cut_power_on_set: Mutex<Option<String>>,
    steal_lock_after_set: Mutex<Option<(String, String)>>,
    powered: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            unreadable: Mutex::new(HashSet::new()),
            tampered: Mutex::new(HashSet::new()),
            blips: Mutex::new(HashSet::new()),
            cut_power_on_set: Mutex::new(None),
            steal_lock_after_set: Mutex::new(None),
            powered: AtomicBool::new(true),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Reads of `key` fail as corrupt.
    pub fn fail_reads_of(&self, key: &str) {
        self.unreadable.lock().insert(key.to_string());
    }

    /// Reads of `key` return a different value than was written.
    pub fn tamper_reads_of(&self, key: &str) {
        self.tampered.lock().insert(key.to_string());
    }

    /// The next read of `key` fails once with a transient error.
    pub fn blip_next_read_of(&self, key: &str) {
        self.blips.lock().insert(key.to_string());
    }

    /// Writing `key` loses power: the write does not land and every later
    /// operation fails until [`restore_power`](Self::restore_power).
    pub fn cut_power_on_write_of(&self, key: &str) {
        *self.cut_power_on_set.lock() = Some(key.to_string());
    }

    pub fn restore_power(&self) {
        *self.cut_power_on_set.lock() = None;
        self.powered.store(true, Ordering::SeqCst);
    }

    /// After `key` is written, another context takes over the lease on `namespace`.
    pub fn steal_lock_after_write_of(&self, key: &str, namespace: &str) {
        *self.steal_lock_after_set.lock() = Some((key.to_string(), namespace.to_string()));
    }

    fn check_power(&self) -> Result<(), StorageError> {
        if self.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("power lost".into()))
        }
    }
}

impl StorageAdapter for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_power()?;
        if self.blips.lock().remove(key) {
            return Err(StorageError::Transient("blip".into()));
        }
        if self.unreadable.lock().contains(key) {
            return Err(StorageError::corrupt(key, "injected read failure"));
        }
        let value = self.inner.get(key)?;
        if self.tampered.lock().contains(key) {
            return Ok(value.map(|v| format!("{v}#tampered")));
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_power()?;
        if self.cut_power_on_set.lock().as_deref() == Some(key) {
            self.powered.store(false, Ordering::SeqCst);
            return Err(StorageError::Unavailable("power lost".into()));
        }
        self.inner.set(key, value)?;
        let steal = self.steal_lock_after_set.lock().take_if(|entry| entry.0 == key);
        if let Some((_, namespace)) = steal {
            let thief = LockRecord {
                holder_id: "thief".into(),
                acquired_at_ms: u64::MAX - 1,
                renewed_at_ms: u64::MAX - 1,
                ttl_ms: 1,
                nonce: "00".into(),
            };
            self.inner.set(
                &keys::lock(&namespace),
                &serde_json::to_string(&thief).unwrap(),
            )?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_power()?;
        self.inner.remove(key)
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        self.check_power()?;
        self.inner.list_keys(prefix)
    }
}

/// Non-control contents of `store`.
pub fn user_data(store: &MemoryStore) -> BTreeMap<String, String> {
    store
        .dump()
        .into_iter()
        .filter(|(key, _)| !key.starts_with(rehome::storage::CONTROL_PREFIX))
        .collect()
}

pub fn test_config() -> MigrationConfig {
    MigrationConfig::default()
}
