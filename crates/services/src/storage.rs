//! Flat keyed persistence with versioned state envelopes.
//!
//! Each namespace is stored as `{"version": N, "state": ...}`. Loading runs the
//! namespace's forward migration once when the stored version is older than
//! the current one, then writes the migrated state back.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "DESKCHAT_DATA_DIR";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored {key} is not valid JSON: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when nothing was ever saved under `key`.
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn save(&self, key: &str, value: &Value) -> Result<(), StorageError>;
}

/// One `<key>.json` file per namespace under a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$DESKCHAT_DATA_DIR`, else the platform data directory, else `./data`.
    pub fn default_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        directories::ProjectDirs::from("com.local", "DeskChat", "DeskChat")
            .map(|p| p.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StorageError::Json {
                key: key.to_string(),
                source,
            })
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })?;

        // Write beside the target then rename, so a crash never leaves half a file.
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &target).map_err(io_err)?;
        debug!(path = %target.display(), "state saved");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// Load a namespace, migrating older state to `version`.
///
/// A stored value without the envelope counts as version 0. `migrate` gets
/// the raw state and the version it was written at. Returns `T::default()`
/// when nothing is stored.
pub fn load_versioned<T, F>(
    store: &dyn KeyValueStore,
    key: &str,
    version: u32,
    migrate: F,
) -> Result<T, StorageError>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(Value, u32) -> Value,
{
    let Some(raw) = store.load(key)? else {
        return Ok(T::default());
    };
    let (stored_version, state) = split_envelope(raw);

    let state = if stored_version < version {
        info!(key, from = stored_version, to = version, "migrating stored state");
        let migrated = migrate(state, stored_version);
        store.save(key, &envelope(version, &migrated))?;
        migrated
    } else {
        state
    };
    serde_json::from_value(state).map_err(|source| StorageError::Json {
        key: key.to_string(),
        source,
    })
}

pub fn save_versioned<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    version: u32,
    state: &T,
) -> Result<(), StorageError> {
    let state = serde_json::to_value(state).map_err(|source| StorageError::Json {
        key: key.to_string(),
        source,
    })?;
    store.save(key, &envelope(version, &state))
}

fn envelope(version: u32, state: &Value) -> Value {
    json!({ "version": version, "state": state })
}

fn split_envelope(raw: Value) -> (u32, Value) {
    match raw {
        Value::Object(mut map) if map.contains_key("version") && map.contains_key("state") => {
            let version = map
                .get("version")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            (version, map.remove("state").unwrap_or(Value::Null))
        }
        other => (0, other),
    }
}
