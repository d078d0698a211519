//! Persistent key-value storage for the access and refresh tokens

use crate::error::StorageError;
use papaya::HashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Key of the stored access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Key of the stored refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Durable string key-value store used by the client for its tokens
///
/// `set_many` and `remove_many` are one logical write each: either every
/// entry is applied or the call fails.
pub trait TokenStorage: Send + Sync + 'static {
    /// Read a single entry
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;

    /// Write several entries as one operation
    fn set_many(
        &self,
        entries: &[(&str, &str)],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Remove several entries as one operation; missing keys are not an error
    fn remove_many(&self, keys: &[&str]) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Thread-safe in-memory token store using Papaya HashMap
///
/// Nothing survives the process; useful for tests and short-lived tools.
#[derive(Clone)]
pub struct MemoryTokenStorage {
    entries: Arc<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(HashMap::new()),
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTokenStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStorage for MemoryTokenStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.pin().get(key).cloned())
    }

    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let map = self.entries.pin();
        for (key, value) in entries {
            map.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let map = self.entries.pin();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}

/// Token store backed by a JSON object on disk
///
/// Writes go to a sibling temporary file which is then renamed over the
/// real one, so a crash never leaves half a token pair behind.
pub struct FileTokenStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store under the platform's local data directory (`<data>/chronos/tokens.json`)
    pub fn default_location() -> Result<Self, StorageError> {
        let dir = dirs::data_local_dir().ok_or(StorageError::NoDataDir)?;
        Ok(Self::new(dir.join("chronos").join("tokens.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl TokenStorage for FileTokenStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut entries = self.load().await?;
        Ok(entries.remove(key))
    }

    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load().await?;
        for (key, value) in entries {
            stored.insert(key.to_string(), value.to_string());
        }
        self.save(&stored).await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load().await?;
        let before = stored.len();
        for key in keys {
            stored.remove(*key);
        }
        if stored.len() == before {
            return Ok(());
        }
        self.save(&stored).await
    }
}
