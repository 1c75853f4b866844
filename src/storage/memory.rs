use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{SnapshotStore, StorageError};

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(key: &str) -> StorageError {
        StorageError::Io {
            operation: "lock",
            key: key.to_string(),
            source: std::io::Error::other("memory store lock poisoned"),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned(key))?;
        if !overwrite && objects.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned(key))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned(key))?;
        Ok(objects.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned(prefix))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned(key))?;
        Ok(objects.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_filters_by_prefix() {
        let store = MemorySnapshotStore::new();
        store.put("c1/a", b"1", false).unwrap();
        store.put("c10/a", b"1", false).unwrap();
        store.put("c2/a", b"1", false).unwrap();
        assert_eq!(store.list("c1/").unwrap(), vec!["c1/a"]);
        assert_eq!(store.list("").unwrap().len(), 3);
    }
}
