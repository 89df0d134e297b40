//! Synchronous key-value storage backends.
//!
//! The cache layer is written against [`KeyValueStorage`], a small
//! string-to-string store with a byte quota, modelled on browser local
//! storage. Two backends are provided:
//!
//! - [`MemoryStorage`]: process-local, used by tests and ephemeral sessions
//! - [`FileStorage`]: one JSON file per key under a directory, so cached
//!   data survives restarts
//!
//! Both count `key.len() + value.len()` bytes against the quota and refuse
//! writes that would exceed it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Practical local storage budget most browsers grant per origin.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Extension used for entry files written by [`FileStorage`].
const ENTRY_EXTENSION: &str = "json";

/// Extension for entries whose key is too long to spell out in a file name.
const HASHED_EXTENSION: &str = "hashed";

/// Longest key kept verbatim (hex-encoded) in a file name. Hex doubles the
/// length and most filesystems stop at 255 bytes per name.
const MAX_NAMED_KEY_BYTES: usize = 100;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Quota exceeded writing {key}: need {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Remove every item.
    fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys()? {
            self.remove_item(&key)?;
        }
        Ok(())
    }

    /// Bytes currently counted against the quota.
    fn used_bytes(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for key in self.keys()? {
            if let Some(value) = self.get_item(&key)? {
                total += key.len() + value.len();
            }
        }
        Ok(total)
    }

    fn quota_bytes(&self) -> usize {
        DEFAULT_QUOTA_BYTES
    }
}

fn check_quota(
    key: &str,
    value: &str,
    used: usize,
    replaced: usize,
    quota: usize,
) -> Result<(), StorageError> {
    let needed = key.len() + value.len();
    let available = quota.saturating_sub(used.saturating_sub(replaced));
    if needed > available {
        return Err(StorageError::QuotaExceeded {
            key: key.to_string(),
            needed,
            available,
        });
    }
    Ok(())
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
    quota: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            quota,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.items
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.lock()?;
        let used: usize = items.iter().map(|(k, v)| k.len() + v.len()).sum();
        let replaced = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        check_quota(key, value, used, replaced, self.quota)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.lock()?.clear();
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.iter().map(|(k, v)| k.len() + v.len()).sum())
    }

    fn quota_bytes(&self) -> usize {
        self.quota
    }
}

// ============================================================================
// On-disk backend
// ============================================================================

/// Stores each key as `<hex(key)>.json` inside a directory.
///
/// Keys longer than 100 bytes go to `<sha256(key)>.hashed` instead, whose
/// first line holds the hex-encoded key and the rest the value.
pub struct FileStorage {
    dir: PathBuf,
    quota: usize,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        Self::with_quota(dir, DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(dir: PathBuf, quota: usize) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_hashed(key: &str) -> bool {
        key.len() > MAX_NAMED_KEY_BYTES
    }

    fn item_path(&self, key: &str) -> PathBuf {
        if Self::is_hashed(key) {
            let digest = Sha256::digest(key.as_bytes());
            self.dir
                .join(format!("{}.{}", hex::encode(digest), HASHED_EXTENSION))
        } else {
            self.dir
                .join(format!("{}.{}", hex::encode(key), ENTRY_EXTENSION))
        }
    }

    fn decode_key(encoded: &str) -> Option<String> {
        let bytes = hex::decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Split a hashed entry file into its key and value.
    fn split_hashed(contents: &str) -> Option<(String, &str)> {
        let (encoded, value) = contents.split_once('\n')?;
        Some((Self::decode_key(encoded)?, value))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        match path.extension()?.to_str()? {
            ENTRY_EXTENSION => Self::decode_key(path.file_stem()?.to_str()?),
            HASHED_EXTENSION => {
                let contents = std::fs::read_to_string(path).ok()?;
                Self::split_hashed(&contents).map(|(key, _)| key)
            }
            _ => None,
        }
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.item_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        if !Self::is_hashed(key) {
            return Ok(Some(contents));
        }
        match Self::split_hashed(&contents) {
            Some((stored, value)) if stored == key => Ok(Some(value.to_string())),
            _ => {
                debug!(?path, "Hashed entry holds another key");
                Ok(None)
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let used = self.used_bytes()?;
        let replaced = match self.get_item(key)? {
            Some(existing) => key.len() + existing.len(),
            None => 0,
        };
        check_quota(key, value, used, replaced, self.quota)?;
        if Self::is_hashed(key) {
            std::fs::write(self.item_path(key), format!("{}\n{}", hex::encode(key), value))?;
        } else {
            std::fs::write(self.item_path(key), value)?;
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.item_path(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            match Self::key_from_path(&path) {
                Some(key) => keys.push(key),
                None => debug!(?path, "Skipping foreign file in cache directory"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn used_bytes(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for key in self.keys()? {
            let mut len = std::fs::metadata(self.item_path(&key))?.len() as usize;
            if Self::is_hashed(&key) {
                // Header line: hex key plus newline
                len = len.saturating_sub(key.len() * 2 + 1);
            }
            total += key.len() + len;
        }
        Ok(total)
    }

    fn quota_bytes(&self) -> usize {
        self.quota
    }
}
