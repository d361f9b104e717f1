use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, to_rfc3339};
use crate::error::{MigrationError, Result};
use crate::migration::checksum::{self, KeyChecksum};
use crate::retry::RetryPolicy;
use crate::storage::{ReservedKeys, StorageAdapter, keys};

/// Point-in-time copy of the destination namespace, taken before the first
/// destructive write so the run can always be rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Zero-padded creation time in milliseconds
    pub id: String,
    pub namespace: String,
    pub created_at_ms: u64,
    /// Human readable creation time
    pub created_at: String,
    /// Marker version this snapshot was taken for
    pub target_version: u32,
    pub entries: BTreeMap<String, String>,
    pub checksums: BTreeMap<String, KeyChecksum>,
}

impl Snapshot {
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn byte_len(&self) -> u64 {
        self.checksums.values().map(|c| c.byte_len).sum()
    }

    /// Every entry has a checksum and every checksum matches its entry.
    pub fn verify(&self) -> bool {
        self.entries.len() == self.checksums.len()
            && self.entries.iter().all(|(key, value)| {
                self.checksums
                    .get(key)
                    .is_some_and(|checksum| checksum.matches(value))
            })
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            created_at: self.created_at.clone(),
            target_version: self.target_version,
            key_count: self.key_count(),
            byte_len: self.byte_len(),
            verified: self.verify(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub namespace: String,
    pub created_at: String,
    pub target_version: u32,
    pub key_count: usize,
    pub byte_len: u64,
    pub verified: bool,
}

/// Creates, restores and prunes destination snapshots.
pub struct SnapshotManager {
    store: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    reserved: ReservedKeys,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        reserved: ReservedKeys,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            reserved,
        }
    }

    fn user_keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self.retry.run(self.clock.as_ref(), "list destination", || {
            self.reserved.user_keys(self.store.as_ref(), namespace)
        })?)
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .retry
            .run(self.clock.as_ref(), "read destination", || self.store.get(key))?)
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        Ok(self
            .retry
            .run(self.clock.as_ref(), "write destination", || self.store.set(key, value))?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Ok(self
            .retry
            .run(self.clock.as_ref(), "remove destination", || self.store.remove(key))?)
    }

    /// Capture every user key of `namespace` and persist the snapshot.
    ///
    /// The persisted copy is read back and verified before returning, so a
    /// snapshot handed to the caller is known to be durable.
    pub fn create_snapshot(&self, namespace: &str, target_version: u32) -> Result<Snapshot> {
        let mut created_at_ms = self.clock.now_ms();
        // Two snapshots in the same millisecond would share a key.
        while self.read(&keys::snapshot(namespace, &snapshot_id(created_at_ms)))?.is_some() {
            created_at_ms += 1;
        }

        let mut entries = BTreeMap::new();
        let mut checksums = BTreeMap::new();
        for key in self.user_keys(namespace)? {
            if let Some(value) = self.read(&key)? {
                checksums.insert(key.clone(), KeyChecksum::of(&key, &value));
                entries.insert(key, value);
            }
        }

        let snapshot = Snapshot {
            id: snapshot_id(created_at_ms),
            namespace: namespace.to_string(),
            created_at_ms,
            created_at: to_rfc3339(created_at_ms),
            target_version,
            entries,
            checksums,
        };

        let storage_key = keys::snapshot(namespace, &snapshot.id);
        let payload = serde_json::to_string(&snapshot)?;
        self.write(&storage_key, &payload)?;

        match self.load_snapshot(namespace, &snapshot.id)? {
            Some(persisted) if persisted == snapshot && persisted.verify() => {}
            _ => {
                return Err(MigrationError::SanityCheck(format!(
                    "snapshot {} did not read back intact",
                    snapshot.id
                )));
            }
        }

        info!(
            "snapshot {} of {namespace:?}: {} key(s), {} byte(s)",
            snapshot.id,
            snapshot.key_count(),
            snapshot.byte_len()
        );
        Ok(snapshot)
    }

    pub fn load_snapshot(&self, namespace: &str, id: &str) -> Result<Option<Snapshot>> {
        match self.read(&keys::snapshot(namespace, id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn verify_snapshot(&self, snapshot: &Snapshot) -> bool {
        snapshot.verify()
    }

    /// Snapshots of `namespace` (all namespaces when `None`), newest first.
    /// Records that fail to decode are skipped with a warning.
    pub fn list_snapshots(&self, namespace: Option<&str>) -> Result<Vec<Snapshot>> {
        let prefix = match namespace {
            Some(ns) => keys::snapshot_prefix(ns),
            None => keys::all_snapshots_prefix(),
        };
        let storage_keys = self.retry.run(self.clock.as_ref(), "list snapshots", || {
            self.store.list_keys(Some(&prefix))
        })?;

        let mut snapshots = Vec::new();
        for key in storage_keys {
            let Some(raw) = self.read(&key)? else {
                continue;
            };
            match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) if namespace.is_none_or(|ns| ns == snapshot.namespace) => {
                    snapshots.push(snapshot)
                }
                Ok(_) => {}
                Err(err) => warn!("skipping unreadable snapshot {key}: {err}"),
            }
        }
        snapshots.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(snapshots)
    }

    /// Replace the namespace's current contents with exactly the snapshot's.
    ///
    /// Every restored key is re-read and checksummed afterwards.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.verify() {
            return Err(MigrationError::SanityCheck(format!(
                "snapshot {} failed verification; refusing to restore",
                snapshot.id
            )));
        }

        let namespace = &snapshot.namespace;
        for key in self.user_keys(namespace)? {
            if !snapshot.entries.contains_key(&key) {
                self.delete(&key)?;
            }
        }
        for (key, value) in &snapshot.entries {
            self.write(key, value)?;
        }

        for (key, expected) in &snapshot.checksums {
            let found = self.read(key)?;
            if !found.as_deref().is_some_and(|value| expected.matches(value)) {
                return Err(MigrationError::ChecksumMismatch {
                    key: key.clone(),
                    expected: expected.digest.clone(),
                    found: found
                        .map(|v| checksum::compute(&v))
                        .unwrap_or_else(|| "<missing>".to_string()),
                });
            }
        }
        let remaining = self.user_keys(namespace)?.len();
        if remaining != snapshot.key_count() {
            return Err(MigrationError::SanityCheck(format!(
                "restored {namespace:?} holds {remaining} key(s), snapshot has {}",
                snapshot.key_count()
            )));
        }

        info!(
            "restored {namespace:?} from snapshot {} ({} key(s))",
            snapshot.id,
            snapshot.key_count()
        );
        Ok(())
    }

    /// Delete a snapshot. Only called after a verified, committed run or on
    /// explicit request.
    pub fn prune_snapshot(&self, namespace: &str, id: &str) -> Result<bool> {
        let key = keys::snapshot(namespace, id);
        if self.read(&key)?.is_none() {
            return Ok(false);
        }
        self.delete(&key)?;
        info!("pruned snapshot {id} of {namespace:?}");
        Ok(true)
    }
}

fn snapshot_id(created_at_ms: u64) -> String {
    format!("{created_at_ms:013}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> SnapshotManager {
        SnapshotManager::new(
            store,
            Arc::new(ManualClock::new(1_700_000_000_000)),
            RetryPolicy::none(),
            ReservedKeys::default(),
        )
    }

    #[test]
    fn test_create_snapshot_excludes_control_keys() {
        let store = Arc::new(MemoryStore::from_pairs([("a", "1"), ("b", "2")]));
        store.set(&keys::version_marker(), "{\"version\":1}").unwrap();
        let snapshots = manager(store.clone());

        let snapshot = snapshots.create_snapshot("", 2).unwrap();
        assert_eq!(snapshot.key_count(), 2);
        assert!(snapshot.verify());
        assert!(!snapshot.entries.contains_key(&keys::version_marker()));
        assert_eq!(
            snapshots.load_snapshot("", &snapshot.id).unwrap(),
            Some(snapshot)
        );
    }

    #[test]
    fn test_same_millisecond_snapshots_get_distinct_ids() {
        let store = Arc::new(MemoryStore::new("dest"));
        let snapshots = manager(store);
        let first = snapshots.create_snapshot("", 2).unwrap();
        let second = snapshots.create_snapshot("", 2).unwrap();
        assert_ne!(first.id, second.id);
        let listed = snapshots.list_snapshots(Some("")).unwrap();
        assert_eq!(listed[0].id, second.id);
    }

    #[test]
    fn test_restore_rewrites_namespace_exactly() {
        let store = Arc::new(MemoryStore::from_pairs([("a", "1"), ("b", "2")]));
        let snapshots = manager(store.clone());
        let snapshot = snapshots.create_snapshot("", 2).unwrap();

        store.set("a", "changed").unwrap();
        store.remove("b").unwrap();
        store.set("c", "new").unwrap();

        snapshots.restore_snapshot(&snapshot).unwrap();
        let user: BTreeMap<_, _> = store
            .dump()
            .into_iter()
            .filter(|(k, _)| !k.starts_with(crate::storage::CONTROL_PREFIX))
            .collect();
        assert_eq!(user, snapshot.entries);
    }

    #[test]
    fn test_tampered_snapshot_is_not_restored() {
        let store = Arc::new(MemoryStore::from_pairs([("a", "1")]));
        let snapshots = manager(store.clone());
        let mut snapshot = snapshots.create_snapshot("", 2).unwrap();
        snapshot.entries.insert("a".into(), "2".into());
        store.set("a", "keep").unwrap();

        assert!(snapshots.restore_snapshot(&snapshot).is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("keep"));
    }

    #[test]
    fn test_prune_snapshot() {
        let store = Arc::new(MemoryStore::from_pairs([("a", "1")]));
        let snapshots = manager(store);
        let snapshot = snapshots.create_snapshot("", 2).unwrap();
        assert!(snapshots.prune_snapshot("", &snapshot.id).unwrap());
        assert!(!snapshots.prune_snapshot("", &snapshot.id).unwrap());
        assert!(snapshots.list_snapshots(None).unwrap().is_empty());
    }
}
