//! Persisted configuration storage.
//!
//! The runtime persists the last selected device session so reconnection can
//! be attempted at startup without rediscovery. Storage is abstracted so the
//! same logic works against files on Linux and an in-memory map in tests.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::{DeviceId, Endpoint};

/// Errors that can occur during configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// The requested configuration was not found.
    NotFound(String),
    /// Failed to read configuration.
    ReadError(String),
    /// Failed to write configuration.
    WriteError(String),
    /// Configuration data is invalid.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(key) => write!(f, "Configuration not found: {}", key),
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::WriteError(msg) => write!(f, "Write error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Key under which the last selected session is stored.
pub const LAST_SESSION_KEY: &str = "last_session";

/// The device the user last connected to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSession {
    pub device_id: DeviceId,
    pub endpoint: Endpoint,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Abstract configuration storage.
///
/// Values are stored as JSON documents under string keys. All methods are
/// synchronous; callers in async code keep writes small and infrequent.
pub trait ConfigStorage: Send + Sync {
    /// Load the raw JSON document stored under `key`.
    fn load_raw(&self, key: &str) -> Result<String, ConfigError>;

    /// Store a raw JSON document under `key`.
    fn save_raw(&self, key: &str, json: &str) -> Result<(), ConfigError>;

    /// Check if a key exists.
    fn has_key(&self, key: &str) -> bool;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete_key(&self, key: &str) -> Result<(), ConfigError>;

    /// Load the last selected session, if one was saved.
    fn load_last_session(&self) -> Result<Option<LastSession>, ConfigError> {
        match self.load_raw(LAST_SESSION_KEY) {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| ConfigError::InvalidData(e.to_string())),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist the last selected session.
    fn save_last_session(&self, session: &LastSession) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        self.save_raw(LAST_SESSION_KEY, &json)
    }

    /// Forget the last selected session.
    fn clear_last_session(&self) -> Result<(), ConfigError> {
        self.delete_key(LAST_SESSION_KEY)
    }

    /// Load a typed value by key.
    fn load_value<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError>
    where
        Self: Sized,
    {
        let json = self.load_raw(key)?;
        serde_json::from_str(&json).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    /// Save a typed value by key.
    fn save_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        Self: Sized,
    {
        let json =
            serde_json::to_string_pretty(value).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        self.save_raw(key, &json)
    }
}

/// File-based storage: one `<key>.json` file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    dir: PathBuf,
}

impl FileConfigStorage {
    /// Use `dir` for storage, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load_raw(&self, key: &str) -> Result<String, ConfigError> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(key.to_string()))
            }
            Err(e) => Err(ConfigError::ReadError(format!("{}: {}", path.display(), e))),
        }
    }

    fn save_raw(&self, key: &str, json: &str) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", path.display(), e)))
    }

    fn has_key(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    fn delete_key(&self, key: &str) -> Result<(), ConfigError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::WriteError(e.to_string())),
        }
    }
}

/// In-memory storage, used by tests and when no config directory is usable.
#[derive(Debug, Default)]
pub struct MemoryConfigStorage {
    data: std::sync::RwLock<std::collections::HashMap<String, String>>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStorage for MemoryConfigStorage {
    fn load_raw(&self, key: &str) -> Result<String, ConfigError> {
        let data = self
            .data
            .read()
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    fn save_raw(&self, key: &str, json: &str) -> Result<(), ConfigError> {
        self.data
            .write()
            .map_err(|e| ConfigError::WriteError(e.to_string()))?
            .insert(key.to_string(), json.to_string());
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.data
            .read()
            .map(|d| d.contains_key(key))
            .unwrap_or(false)
    }

    fn delete_key(&self, key: &str) -> Result<(), ConfigError> {
        self.data
            .write()
            .map_err(|e| ConfigError::WriteError(e.to_string()))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_session() -> LastSession {
        LastSession {
            device_id: DeviceId::new("esp32m-1a2b"),
            endpoint: Endpoint::direct("ws://10.0.0.5/ws"),
            saved_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_last_session_round_trip() {
        let storage = MemoryConfigStorage::new();
        assert_eq!(storage.load_last_session().unwrap(), None);

        let session = last_session();
        storage.save_last_session(&session).unwrap();
        assert_eq!(storage.load_last_session().unwrap(), Some(session));

        storage.clear_last_session().unwrap();
        assert_eq!(storage.load_last_session().unwrap(), None);
    }

    #[test]
    fn test_corrupt_last_session() {
        let storage = MemoryConfigStorage::new();
        storage.save_raw(LAST_SESSION_KEY, "{not json").unwrap();
        assert!(matches!(
            storage.load_last_session(),
            Err(ConfigError::InvalidData(_))
        ));
    }

    #[test]
    fn test_typed_values() {
        let storage = MemoryConfigStorage::new();
        storage
            .save_value("plugin_wifi", &serde_json::json!({"enabled": true}))
            .unwrap();
        let loaded: serde_json::Value = storage.load_value("plugin_wifi").unwrap();
        assert_eq!(loaded["enabled"], true);
        assert!(storage.has_key("plugin_wifi"));
    }

    #[test]
    fn test_file_storage() {
        let dir = std::env::temp_dir().join(format!("devlink-test-{}", uuid::Uuid::new_v4()));
        let storage = FileConfigStorage::new(&dir).unwrap();

        let session = last_session();
        storage.save_last_session(&session).unwrap();
        assert!(dir.join("last_session.json").exists());

        let reopened = FileConfigStorage::new(&dir).unwrap();
        assert_eq!(reopened.load_last_session().unwrap(), Some(session));

        reopened.clear_last_session().unwrap();
        reopened.clear_last_session().unwrap();
        assert!(!reopened.has_key(LAST_SESSION_KEY));

        std::fs::remove_dir_all(&dir).ok();
    }
}
