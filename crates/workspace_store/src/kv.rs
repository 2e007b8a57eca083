//! Durable key-value backends.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::NamedTempFile;
use workspace_model::lock_unpoisoned;

use crate::error::StoreError;
use crate::keys::{key_file_name, key_from_file_name};

/// String-valued storage shared by every client instance on a machine.
///
/// Writes are whole-value replacements; concurrent writers race per key and the
/// last write wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fails with [`StoreError::QuotaExceeded`] when the write would push usage
    /// past the store's quota. A failed write leaves the previous value intact.
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    fn usage_bytes(&self) -> Result<u64, StoreError>;

    fn quota_bytes(&self) -> Option<u64>;
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

fn check_quota(
    quota: Option<u64>,
    key: &str,
    usage_without_key: u64,
    value: &str,
) -> Result<(), StoreError> {
    let Some(limit) = quota else {
        return Ok(());
    };
    let needed = usage_without_key + entry_size(key, value);
    if needed > limit {
        return Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            needed,
            limit,
        });
    }
    Ok(())
}

/// One JSON file per logical key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    quota: Option<u64>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|source| StoreError::io("creating storage directory", &root, source))?;
        Ok(Self { root, quota: None })
    }

    #[must_use]
    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key_file_name(key))
    }

    fn stored_entries(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let read_dir = fs::read_dir(&self.root)
            .map_err(|source| StoreError::io("listing storage directory", &self.root, source))?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry
                .map_err(|source| StoreError::io("listing storage directory", &self.root, source))?;
            let file_name = dir_entry.file_name();
            let Some(key) = file_name.to_str().and_then(key_from_file_name) else {
                continue;
            };
            let metadata = dir_entry
                .metadata()
                .map_err(|source| StoreError::io("reading metadata", dir_entry.path(), source))?;
            if metadata.is_file() {
                let size = key.len() as u64 + metadata.len();
                entries.push((key, size));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::io("reading record", path, source)),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.quota.is_some() {
            let usage_without_key: u64 = self
                .stored_entries()?
                .into_iter()
                .filter(|(stored, _)| stored != key)
                .map(|(_, size)| size)
                .sum();
            check_quota(self.quota, key, usage_without_key, value)?;
        }

        let path = self.path_for(key);
        let mut temp = NamedTempFile::new_in(&self.root)
            .map_err(|source| StoreError::io("creating temporary record", &self.root, source))?;
        temp.write_all(value.as_bytes())
            .map_err(|source| StoreError::io("writing temporary record", temp.path(), source))?;
        temp.persist(&path)
            .map_err(|error| StoreError::io("replacing record", &path, error.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::io("removing record", path, source)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .stored_entries()?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn usage_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.stored_entries()?.iter().map(|(_, size)| size).sum())
    }

    fn quota_bytes(&self) -> Option<u64> {
        self.quota
    }
}

/// Process-local store. Clones share the same map, which lets tests model two
/// client instances writing to the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota: Option<u64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: Arc::default(),
            quota: Some(quota),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        lock_unpoisoned(&self.entries)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let usage_without_key: u64 = entries
            .iter()
            .filter(|(stored, _)| stored.as_str() != key)
            .map(|(stored, stored_value)| entry_size(stored, stored_value))
            .sum();
        check_quota(self.quota, key, usage_without_key, value)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries().keys().cloned().collect())
    }

    fn usage_bytes(&self) -> Result<u64, StoreError> {
        Ok(self
            .entries()
            .iter()
            .map(|(key, value)| entry_size(key, value))
            .sum())
    }

    fn quota_bytes(&self) -> Option<u64> {
        self.quota
    }
}
