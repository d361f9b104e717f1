use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{StorageAdapter, hex_encode};
use crate::error::StorageError;

const VALUE_EXT: &str = "val";

/// On-disk form of one entry. The file name only identifies the key's digest.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
}

/// The new backend: one file per key under a root directory.
///
/// File names are the SHA-256 of the key, so keys of any length fit within
/// the filesystem's name limit; the key itself is kept inside the file.
/// Writes land in a temp file that is synced and renamed over the target, so a
/// reader never observes a torn value.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&root, Permissions::from_mode(0o700));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(format!("{}.{VALUE_EXT}", hex_encode(&digest)))
    }

    fn read_entry(path: &Path) -> Result<Option<StoredEntry>, StorageError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                StorageError::corrupt(&path.display().to_string(), err.to_string())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_root(&self) -> Result<(), StorageError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "store directory {} is missing",
                self.root.display()
            )))
        }
    }
}

impl StorageAdapter for DirStore {
    fn name(&self) -> &str {
        "dir"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_root()?;
        let entry = Self::read_entry(&self.value_path(key))
            .map_err(|_| StorageError::corrupt(key, "stored entry is unreadable"))?;
        match entry {
            Some(entry) if entry.key == key => Ok(Some(entry.value)),
            Some(entry) => Err(StorageError::corrupt(
                key,
                format!("file holds key {:?}", entry.key),
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_root()?;
        let target = self.value_path(key);
        let payload = serde_json::to_vec(&StoredEntry {
            key: key.to_string(),
            value: value.to_string(),
        })
        .map_err(|err| StorageError::corrupt(key, err.to_string()))?;
        let mut suffix = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp = self.root.join(format!(".{}.tmp", hex_encode(&suffix)));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, Permissions::from_mode(0o600));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_root()?;
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        self.ensure_root()?;
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            let key = match Self::read_entry(&path) {
                Ok(Some(entry)) => entry.key,
                Ok(None) => continue,
                Err(StorageError::Corrupt { .. }) => {
                    log::warn!("skipping unrecognised file {}", path.display());
                    continue;
                }
                Err(err) => return Err(err),
            };
            if prefix.is_none_or(|p| key.starts_with(p)) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
