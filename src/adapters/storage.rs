//! Storage adapters.
//!
//! Both implement [`StoragePort`]:
//!
//! - [`MemoryStorage`]: in-process map, for tests and short simulations.
//! - [`FileStorage`]: one directory per namespace, one file per key.
//!   Writes go to a temp file first and are published with a rename (or a
//!   hard link for [`StoragePort::append`], which fails if the key already
//!   exists), so a crash never leaves a half-written value behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::app::ports::{StoragePort, is_valid_key};
use crate::error::StorageError;

fn check(namespace: &str, key: &str) -> Result<(), StorageError> {
    if is_valid_key(namespace) && is_valid_key(key) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    store: BTreeMap<(String, String), Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl StoragePort for MemoryStorage {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        check(namespace, key)?;
        self.store
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        check(namespace, key)?;
        self.store.insert((namespace.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn append(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        check(namespace, key)?;
        let slot = (namespace.to_string(), key.to_string());
        if self.store.contains_key(&slot) {
            return Err(StorageError::AlreadyExists);
        }
        self.store.insert(slot, data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        check(namespace, key)?;
        self.store.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.store.contains_key(&(namespace.to_string(), key.to_string()))
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        if !is_valid_key(namespace) {
            return Err(StorageError::InvalidKey);
        }
        Ok(self
            .store
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

const TEMP_SUFFIX: &str = ".tmp";

pub struct FileStorage {
    root: PathBuf,
    temp_seq: AtomicU64,
}

impl FileStorage {
    /// Open (and create if needed) a storage root directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            warn!("FileStorage: cannot create {}: {e}", root.display());
            StorageError::IoError
        })?;
        info!("FileStorage: root {}", root.display());
        Ok(Self { root, temp_seq: AtomicU64::new(0) })
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(key)
    }

    /// Write `data` to a fresh temp file in the namespace directory.
    fn stage(&self, namespace: &str, key: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir).map_err(|_| StorageError::IoError)?;
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{key}.{}.{seq}{TEMP_SUFFIX}", std::process::id()));
        let mut file = fs::File::create(&tmp).map_err(|_| StorageError::IoError)?;
        file.write_all(data).map_err(|_| StorageError::IoError)?;
        file.sync_all().map_err(|_| StorageError::IoError)?;
        Ok(tmp)
    }
}

impl StoragePort for FileStorage {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        check(namespace, key)?;
        fs::read(self.path(namespace, key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound,
            _ => StorageError::IoError,
        })
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        check(namespace, key)?;
        let tmp = self.stage(namespace, key, data)?;
        fs::rename(&tmp, self.path(namespace, key)).map_err(|_| {
            let _ = fs::remove_file(&tmp);
            StorageError::IoError
        })?;
        debug!("FileStorage: wrote {namespace}/{key} ({} bytes)", data.len());
        Ok(())
    }

    fn append(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        check(namespace, key)?;
        let tmp = self.stage(namespace, key, data)?;
        let linked = fs::hard_link(&tmp, self.path(namespace, key));
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!("FileStorage: appended {namespace}/{key} ({} bytes)", data.len());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists),
            Err(_) => Err(StorageError::IoError),
        }
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        check(namespace, key)?;
        match fs::remove_file(self.path(namespace, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(_) => Err(StorageError::IoError),
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        check(namespace, key).is_ok() && self.path(namespace, key).is_file()
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        if !is_valid_key(namespace) {
            return Err(StorageError::InvalidKey);
        }
        let entries = match fs::read_dir(self.namespace_dir(namespace)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(_) => return Err(StorageError::IoError),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|_| StorageError::IoError)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) || !is_valid_key(&name) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }
}
