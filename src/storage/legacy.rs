use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::StorageAdapter;
use crate::error::StorageError;

/// The legacy backend: every key lives in a single JSON object file, the way
/// the old app dumped its local storage.
///
/// The file is re-read on every call so several processes see each other's
/// writes. Values that are not JSON strings are reported as corrupt.
pub struct LegacyJsonStore {
    path: PathBuf,
}

impl LegacyJsonStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, StorageError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let data = fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StorageError::Unavailable(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
            Err(err) => Err(StorageError::Unavailable(format!(
                "failed to parse {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, map: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(map)
            .map_err(|err| StorageError::Transient(format!("serialize legacy store: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

impl StorageAdapter for LegacyJsonStore {
    fn name(&self) -> &str {
        "legacy"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.load()?.remove(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(other) => Err(StorageError::corrupt(
                key,
                format!("expected a string, found {}", json_kind(&other)),
            )),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut map = self.load()?;
        map.insert(key.to_string(), Value::String(value.to_string()));
        self.save(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .load()?
            .keys()
            .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_store() {
        let temp = tempdir().unwrap();
        let store = LegacyJsonStore::new(temp.path().join("legacy.json"));
        assert!(store.list_keys(None).unwrap().is_empty());
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_set_get_remove() {
        let temp = tempdir().unwrap();
        let store = LegacyJsonStore::new(temp.path().join("legacy.json"));
        store.set("roster", "[1,2]").unwrap();
        store.set("games", "{}").unwrap();
        assert_eq!(store.get("roster").unwrap().as_deref(), Some("[1,2]"));
        assert_eq!(store.list_keys(None).unwrap(), vec!["games", "roster"]);

        store.remove("roster").unwrap();
        assert_eq!(store.get("roster").unwrap(), None);
    }

    #[test]
    fn test_non_string_value_is_corrupt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("legacy.json");
        fs::write(&path, r#"{"ok": "1", "bad": 42}"#).unwrap();
        let store = LegacyJsonStore::new(path);
        assert_eq!(store.get("ok").unwrap().as_deref(), Some("1"));
        assert!(matches!(
            store.get("bad"),
            Err(StorageError::Corrupt { ref key, .. }) if key == "bad"
        ));
    }

    #[test]
    fn test_unparseable_file_is_unavailable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("legacy.json");
        fs::write(&path, "not json").unwrap();
        let store = LegacyJsonStore::new(path);
        assert!(matches!(store.list_keys(None), Err(StorageError::Unavailable(_))));
    }
}
