use relay_core::{RelayError, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::metadata::{SessionState, SESSION_FORMAT_VERSION};

/// Durable string key-value substrate the session blob lives in.
pub trait KeyValueStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key under a base directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the file backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe_name = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.base_dir.join(format!("{}.json", safe_name))
    }
}

impl KeyValueStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::IoError(e)),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");

        // Write to a sibling temp file, then rename over the target.
        if let Err(e) = write_then_rename(&tmp_path, &path, value) {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove temp file {:?}: {}", tmp_path, cleanup);
                }
            }
            return Err(RelayError::IoError(e));
        }

        debug!("Wrote {} bytes to {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::IoError(e)),
        }
    }
}

fn write_then_rename(tmp_path: &Path, path: &Path, value: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp_path)?;
    file.write_all(value.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, path)
}

/// Process-local storage. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RelayError::Internal("memory storage lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RelayError::Internal("memory storage lock poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RelayError::Internal("memory storage lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Reads and writes the whole session as a single serialized blob.
#[derive(Clone)]
pub struct SessionRepository {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
}

impl SessionRepository {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// Restores the saved session. Missing or unreadable data yields an empty session.
    pub fn load(&self) -> SessionState {
        let raw = match self.storage.read(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No saved session under '{}'", self.key);
                return SessionState::empty();
            }
            Err(e) => {
                warn!("Failed to read saved session '{}': {}", self.key, e);
                return SessionState::empty();
            }
        };

        let mut state: SessionState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("Saved session '{}' is corrupt, starting fresh: {}", self.key, e);
                return SessionState::empty();
            }
        };

        if state.version > SESSION_FORMAT_VERSION {
            warn!(
                "Saved session '{}' has unsupported version {}, starting fresh",
                self.key, state.version
            );
            return SessionState::empty();
        }

        let mut seen = HashSet::new();
        let consistent = state
            .conversations
            .iter()
            .all(|c| c.is_consistent() && seen.insert(c.id.clone()));
        if !consistent {
            warn!("Saved session '{}' violates store invariants, starting fresh", self.key);
            return SessionState::empty();
        }

        if let Some(active) = &state.active {
            if !state.contains(active) {
                warn!("Active conversation {} no longer exists, clearing pointer", active);
                state.active = None;
            }
        }

        debug!(
            "Loaded session '{}' with {} conversations",
            self.key,
            state.conversations.len()
        );
        state
    }

    pub fn save(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        self.storage.write(&self.key, &json)?;
        debug!(
            "Saved session '{}' with {} conversations",
            self.key,
            state.conversations.len()
        );
        Ok(())
    }

    /// Deletes the saved session blob.
    pub fn discard(&self) -> Result<()> {
        self.storage.remove(&self.key)?;
        debug!("Discarded session '{}'", self.key);
        Ok(())
    }
}
