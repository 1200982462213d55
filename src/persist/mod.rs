//! Persisted configuration store.
//!
//! The orchestrator treats persisted state as an opaque key/value document.
//! [`MemoryConfigStore`] keeps it in memory; [`JsonFileConfigStore`] mirrors
//! it to a JSON file, rewriting the file on every change.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Key/value access to persisted configuration.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key, returning its previous value.
    fn remove(&self, key: &str) -> Result<Option<Value>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().remove(key))
    }
}

/// Store backed by one JSON object on disk.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileConfigStore {
    /// Load `path`; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map.into_iter().collect(),
                other => {
                    return Err(Error::Config(format!(
                        "{} holds a JSON {}, expected an object",
                        path.display(),
                        json_kind(&other)
                    )))
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} key(s) from {}", values.len(), path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temporary file and rename over the original.
    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<Option<Value>> {
        let mut values = self.values.lock();
        let old = values.remove(key);
        if old.is_some() {
            self.flush(&values)?;
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", json!({"x": 1})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.remove("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.remove("a").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("nvmekit.json");

        let store = JsonFileConfigStore::open(&path).unwrap();
        store.set("targets", json!([{"nqn": "a"}])).unwrap();
        store.set("host", json!("h")).unwrap();
        store.remove("host").unwrap();

        let reopened = JsonFileConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get("targets").unwrap(), Some(json!([{"nqn": "a"}])));
        assert_eq!(reopened.get("host").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert_matches!(JsonFileConfigStore::open(&path), Err(Error::Config(_)));

        fs::write(&path, "{not json").unwrap();
        assert_matches!(
            JsonFileConfigStore::open(&path),
            Err(Error::Serialization(_))
        );
    }
}
