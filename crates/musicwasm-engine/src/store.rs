//! Persisted host state: selected version and download bookkeeping.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Key holding the JSON of the selected [`EngineVersion`](crate::version::EngineVersion).
pub const SELECTED_VERSION_KEY: &str = "selected_version";

pub fn download_completed_key(id: &str) -> String {
    format!("download.{id}.completed")
}

pub fn download_date_key(id: &str) -> String {
    format!("download.{id}.date")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredValue {
    String(String),
    Bool(bool),
    Date(DateTime<Utc>),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredValue>;

    fn set(&self, key: &str, value: StoredValue) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(StoredValue::String(s)) => Some(s),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(StoredValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key) {
            Some(StoredValue::Date(d)) => Some(d),
            _ => None,
        }
    }
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<()> {
        self.values
            .write()
            .map_err(|_| EngineError::Config("store lock poisoned".into()))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .write()
            .map_err(|_| EngineError::Config("store lock poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

/// JSON file store. Every write rewrites the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, StoredValue>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), keys = values.len(), "state store opened");
        Ok(Self {
            path: path.to_path_buf(),
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, StoredValue>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, values)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| EngineError::Io(e.error))?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, StoredValue>)) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| EngineError::Config("store lock poisoned".into()))?;
        apply(&mut values);
        self.persist(&values)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}
