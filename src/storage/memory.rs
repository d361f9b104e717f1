use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::StorageAdapter;
use crate::error::StorageError;

/// In-process backend. Wrap in an `Arc` to share it between contexts.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
            available: AtomicBool::new(true),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new("memory");
        {
            let mut entries = store.entries.write();
            for (key, value) in pairs {
                entries.insert(key.to_string(), value.to_string());
            }
        }
        store
    }

    /// Cap the total bytes (keys plus values) the store accepts.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Copy of every entry, control records included.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "{} storage is disabled",
                self.name
            )))
        }
    }
}

impl StorageAdapter for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut entries = self.entries.write();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "{} quota of {quota} bytes exceeded",
                    self.name
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        self.ensure_available()?;
        let entries = self.entries.read();
        Ok(match prefix {
            Some(prefix) => entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect(),
            None => entries.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_listing() {
        let store = MemoryStore::from_pairs([("app/a", "1"), ("app/b", "2"), ("other", "3")]);
        assert_eq!(store.list_keys(Some("app/")).unwrap(), vec!["app/a", "app/b"]);
        assert_eq!(store.list_keys(None).unwrap().len(), 3);
    }

    #[test]
    fn test_quota_rejects_oversized_write() {
        let store = MemoryStore::new("dest").with_quota(8);
        store.set("k", "1234").unwrap();
        let err = store.set("k2", "123456").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        // overwriting an existing key only counts the new value
        store.set("k", "123456").unwrap();
    }

    #[test]
    fn test_disabled_store_is_unavailable() {
        let store = MemoryStore::new("dest");
        store.set_available(false);
        assert!(matches!(store.get("a"), Err(StorageError::Unavailable(_))));
    }
}
