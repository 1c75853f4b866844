use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use fs2::available_space;
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use super::{SnapshotStore, StorageError};
use crate::LOG_TARGET;

/// Headroom kept free on the volume after a write.
const DEFAULT_MIN_FREE_BYTES: u64 = 16 * 1024 * 1024;

/// Objects as files under `root`; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
    min_free_bytes: u64,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
        }
    }

    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        if key.is_empty()
            || key.contains('\\')
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if !overwrite && path.exists() {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).map_err(|e| StorageError::io("put", key, e))?;

        let available = available_space(parent).map_err(|e| StorageError::io("put", key, e))?;
        let required = bytes.len() as u64 + self.min_free_bytes;
        if available < required {
            return Err(StorageError::QuotaExceeded {
                required,
                available,
            });
        }

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| StorageError::io("put", key, e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io("put", key, e))?;
        if overwrite {
            tmp.persist(&path)
                .map_err(|e| StorageError::io("put", key, e.error))?;
        } else {
            tmp.persist_noclobber(&path).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists {
                        key: key.to_string(),
                    }
                } else {
                    StorageError::io("put", key, e.error)
                }
            })?;
        }
        debug!(target: LOG_TARGET, event = "store_put", key = %key, bytes = bytes.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| StorageError::io("get", key, e))
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io("remove", key, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop"));
                StorageError::io("list", prefix, source)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let key = key.join("/");
            // In-flight temp files from `put`.
            if key.rsplit('/').next().is_some_and(|name| name.starts_with(".tmp")) {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key)?.is_file())
    }
}
