//! Key-value backends.
//!
//! The migration engine only ever talks to storage through [`StorageAdapter`],
//! so the legacy backend, the new backend and test doubles are interchangeable.
//! Control records (locks, snapshots, bookkeeping) live under
//! [`CONTROL_PREFIX`] and are never treated as user data.

pub mod dir;
pub mod legacy;
pub mod memory;

pub use dir::DirStore;
pub use legacy::LegacyJsonStore;
pub use memory::MemoryStore;

use crate::error::StorageError;

pub const CONTROL_PREFIX: &str = "__rehome__/";

pub trait StorageAdapter: Send + Sync {
    /// Short backend name used in log lines.
    fn name(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// Keys starting with `prefix` (all keys when `None`), sorted.
    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;
}

/// Keys excluded from every copy, snapshot and cleanup.
#[derive(Clone, Debug)]
pub struct ReservedKeys {
    prefixes: Vec<String>,
}

impl ReservedKeys {
    pub fn new(extra: &[String]) -> Self {
        let mut prefixes = vec![CONTROL_PREFIX.to_string()];
        prefixes.extend(extra.iter().filter(|p| !p.is_empty()).cloned());
        Self { prefixes }
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }

    /// User keys of `namespace` held by `store`.
    pub fn user_keys(
        &self,
        store: &dyn StorageAdapter,
        namespace: &str,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = (!namespace.is_empty()).then_some(namespace);
        Ok(store
            .list_keys(prefix)?
            .into_iter()
            .filter(|key| !self.is_reserved(key))
            .collect())
    }
}

impl Default for ReservedKeys {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// Layout of the control records.
pub mod keys {
    use super::CONTROL_PREFIX;

    pub fn version_marker() -> String {
        format!("{CONTROL_PREFIX}version")
    }

    pub fn lock(namespace: &str) -> String {
        format!("{CONTROL_PREFIX}lock/{namespace}")
    }

    pub fn snapshot_prefix(namespace: &str) -> String {
        format!("{CONTROL_PREFIX}snapshot/{namespace}/")
    }

    pub fn all_snapshots_prefix() -> String {
        format!("{CONTROL_PREFIX}snapshot/")
    }

    pub fn snapshot(namespace: &str, id: &str) -> String {
        format!("{}{id}", snapshot_prefix(namespace))
    }

    pub fn checksum_index(migration_id: &str) -> String {
        format!("{CONTROL_PREFIX}checksums/{migration_id}")
    }

    pub fn progress(namespace: &str) -> String {
        format!("{CONTROL_PREFIX}progress/{namespace}")
    }

    pub fn attempts(migration_id: &str) -> String {
        format!("{CONTROL_PREFIX}attempts/{migration_id}")
    }

    pub fn journal_prefix(migration_id: &str) -> String {
        format!("{CONTROL_PREFIX}journal/{migration_id}/")
    }

    pub fn journal(migration_id: &str, started_at_ms: u64) -> String {
        format!("{}{started_at_ms:013}", journal_prefix(migration_id))
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys_are_reserved() {
        let reserved = ReservedKeys::new(&["_legacy_meta/".to_string()]);
        assert!(reserved.is_reserved(&keys::lock("app/")));
        assert!(reserved.is_reserved("_legacy_meta/cursor"));
        assert!(!reserved.is_reserved("app/roster"));
    }

    #[test]
    fn test_user_keys_skip_control_records() {
        let store = MemoryStore::from_pairs([("a", "1"), ("b", "2")]);
        store.set(&keys::version_marker(), "{}").unwrap();
        let reserved = ReservedKeys::default();
        assert_eq!(reserved.user_keys(&store, "").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_hex_encode_is_lowercase() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
