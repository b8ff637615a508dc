use anyhow::{Context, anyhow};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Storage key of the session private key.
pub const SESSION_KEY: &str = "cw-session-key";
/// Storage key of the session owner address.
pub const SESSION_OWNER: &str = "cw-session-owner";

const DEFAULT_STORE_DIR: &str = "citizenwallet";
const DEFAULT_STORE_FILE: &str = "session.json";

/// String key-value persistence backing a session across restarts.
///
/// A store is injected into each session rather than shared globally, so two
/// sessions only clobber each other when they are handed the same store.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory store. Clones share the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    items: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

/// Store for environments without persistence. Reads find nothing and writes are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl KeyValueStore for NullStore {
    fn get_item(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn set_item(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_item(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Store persisting all items as a single JSON object on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store backed by the file at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Opens the store in the default location, `<config dir>/citizenwallet/session.json`.
    pub fn open_default() -> anyhow::Result<Self> {
        let path = Self::get_store_dir()?.join(DEFAULT_STORE_FILE);
        Ok(Self::open(path))
    }

    /// Gets the default store directory, creating it if needed.
    pub fn get_store_dir() -> anyhow::Result<PathBuf> {
        let path = dirs::config_dir()
            .context("Could not find config directory")?
            .join(DEFAULT_STORE_DIR);

        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(path)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_items(&self) -> anyhow::Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("Failed to read {}: {e}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse {}: {e}", self.path.display()))
    }

    fn write_items(&self, items: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(items)?;
        fs::write(&self.path, content)
            .map_err(|e| anyhow!("Failed to write {}: {e}", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_items()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.read_items()?;
        items.insert(key.to_string(), value.to_string());
        self.write_items(&items)
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.read_items()?;
        if items.remove(key).is_some() {
            self.write_items(&items)?;
        }
        Ok(())
    }
}
