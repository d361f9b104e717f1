use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::storage::{StorageAdapter, keys};

/// SHA-256 of the value's UTF-8 bytes as lowercase hex.
pub fn compute(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify(value: &str, digest: &str) -> bool {
    compute(value) == digest
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChecksum {
    pub key: String,
    pub digest: String,
    pub byte_len: u64,
}

impl KeyChecksum {
    pub fn of(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            digest: compute(value),
            byte_len: value.len() as u64,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.byte_len == value.len() as u64 && verify(value, &self.digest)
    }
}

/// Checksums recorded while copying, keyed by storage key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumIndex {
    entries: BTreeMap<String, KeyChecksum>,
}

impl ChecksumIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, checksum: KeyChecksum) {
        self.entries.insert(checksum.key.clone(), checksum);
    }

    pub fn get(&self, key: &str) -> Option<&KeyChecksum> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyChecksum> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|c| c.byte_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, store: &dyn StorageAdapter, migration_id: &str) -> Result<(), StorageError> {
        let payload = serde_json::to_string(self)
            .map_err(|err| StorageError::Transient(format!("serialize checksum index: {err}")))?;
        store.set(&keys::checksum_index(migration_id), &payload)
    }

    /// Previously persisted index, or `None` if absent or unreadable.
    pub fn load(store: &dyn StorageAdapter, migration_id: &str) -> Result<Option<Self>, StorageError> {
        let Some(raw) = store.get(&keys::checksum_index(migration_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(index) => Ok(Some(index)),
            Err(err) => {
                log::warn!("ignoring unreadable checksum index for {migration_id}: {err}");
                Ok(None)
            }
        }
    }

    pub fn discard(store: &dyn StorageAdapter, migration_id: &str) -> Result<(), StorageError> {
        store.remove(&keys::checksum_index(migration_id))
    }
}
