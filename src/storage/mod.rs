use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::{codes, AppError};
use crate::snapshot::SnapshotMetadata;
use crate::LOG_TARGET;

mod fs;
mod memory;

pub use fs::FsSnapshotStore;
pub use memory::MemorySnapshotStore;

const REGISTRY_FILE: &str = "manifest.json";
const SNAPSHOT_DIR: &str = "snapshots";
const SNAPSHOT_EXT: &str = "zip";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("object {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("object {key} already exists")]
    AlreadyExists { key: String },
    #[error("not enough space: need {required} bytes, {available} available")]
    QuotaExceeded { required: u64, available: u64 },
    #[error("object is {size} bytes, over the {limit} byte ceiling")]
    TooLarge { size: u64, limit: u64 },
    #[error("invalid storage key component: {0}")]
    InvalidKey(String),
    #[error("storage {operation} failed for {key}: {source}")]
    Io {
        operation: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Io { .. } | StorageError::NotFound { .. } | StorageError::Corrupt { .. }
        )
    }

    fn io(operation: &'static str, key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound {
                key: key.to_string(),
            }
        } else {
            StorageError::Io {
                operation,
                key: key.to_string(),
                source,
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let retryable = err.is_retryable().to_string();
        let app = match &err {
            StorageError::NotFound { key } => {
                AppError::new(codes::NOT_FOUND, err.to_string()).with_context("key", key.clone())
            }
            StorageError::Corrupt { key, .. } => {
                AppError::new(codes::STORAGE_DOWNLOAD_FAILED, err.to_string())
                    .with_context("key", key.clone())
            }
            StorageError::QuotaExceeded { .. } | StorageError::TooLarge { .. } => {
                AppError::new(codes::QUOTA_EXCEEDED, err.to_string())
            }
            StorageError::InvalidKey(_) => AppError::new(codes::INVALID_SNAPSHOT, err.to_string()),
            StorageError::Io { operation, key, .. } if *operation == "get" => {
                AppError::new(codes::STORAGE_DOWNLOAD_FAILED, err.to_string())
                    .with_context("key", key.clone())
            }
            StorageError::Io { key, .. } | StorageError::AlreadyExists { key } => {
                AppError::new(codes::STORAGE_UPLOAD_FAILED, err.to_string())
                    .with_context("key", key.clone())
            }
        };
        app.with_context("retryable", retryable)
    }
}

/// Minimal blob store the snapshot service writes through.
pub trait SnapshotStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Returns whether something was removed.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRegistry {
    /// Newest first.
    pub snapshots: Vec<SnapshotMetadata>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub snapshot_count: usize,
}

fn check_component(value: &str) -> Result<(), StorageError> {
    if value.is_empty()
        || value.contains('/')
        || value.contains('\\')
        || value.contains("..")
        || value.contains('\0')
    {
        return Err(StorageError::InvalidKey(value.to_string()));
    }
    Ok(())
}

pub fn snapshot_key(clinic_id: &str, snapshot_id: &str) -> Result<String, StorageError> {
    check_component(clinic_id)?;
    check_component(snapshot_id)?;
    Ok(format!(
        "{clinic_id}/{SNAPSHOT_DIR}/{snapshot_id}.{SNAPSHOT_EXT}"
    ))
}

pub fn registry_key(clinic_id: &str) -> Result<String, StorageError> {
    check_component(clinic_id)?;
    Ok(format!("{clinic_id}/{REGISTRY_FILE}"))
}

/// Snapshot objects plus a per-clinic registry, with count- and age-based
/// retention.
#[derive(Clone)]
pub struct SnapshotStorageService {
    store: Arc<dyn SnapshotStore>,
    max_snapshots_per_clinic: usize,
    retention_days: i64,
    max_bundle_bytes: u64,
}

impl SnapshotStorageService {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        max_snapshots_per_clinic: usize,
        retention_days: i64,
        max_bundle_bytes: u64,
    ) -> Self {
        Self {
            store,
            max_snapshots_per_clinic: max_snapshots_per_clinic.max(1),
            retention_days,
            max_bundle_bytes,
        }
    }

    pub fn max_bundle_bytes(&self) -> u64 {
        self.max_bundle_bytes
    }

    /// Run storage calls on the blocking pool. The store does plain file
    /// I/O, so async callers go through here instead of calling it inline.
    pub async fn blocking<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&SnapshotStorageService) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let storage = self.clone();
        task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|err| StorageError::Io {
                operation: "task",
                key: String::new(),
                source: std::io::Error::other(err),
            })?
    }

    /// Store packed bytes under `{clinic}/snapshots/{id}.zip`. Never overwrites.
    pub fn upload(
        &self,
        clinic_id: &str,
        snapshot_id: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let key = snapshot_key(clinic_id, snapshot_id)?;
        if bytes.len() as u64 > self.max_bundle_bytes {
            return Err(StorageError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_bundle_bytes,
            });
        }
        self.store.put(&key, bytes, false)?;
        info!(
            target: LOG_TARGET,
            event = "snapshot_uploaded",
            clinic_id = %clinic_id,
            snapshot_id = %snapshot_id,
            bytes = bytes.len()
        );
        Ok(())
    }

    /// Fetch packed bytes. Empty or unreadable archives surface as `Corrupt`;
    /// callers still verify checksums before trusting the content.
    pub fn download(&self, clinic_id: &str, snapshot_id: &str) -> Result<Vec<u8>, StorageError> {
        let key = snapshot_key(clinic_id, snapshot_id)?;
        let bytes = self.store.get(&key)?;
        if bytes.is_empty() {
            return Err(StorageError::Corrupt {
                key,
                reason: "object is empty".to_string(),
            });
        }
        if let Err(err) = ZipArchive::new(Cursor::new(bytes.as_slice())) {
            return Err(StorageError::Corrupt {
                key,
                reason: err.to_string(),
            });
        }
        info!(
            target: LOG_TARGET,
            event = "snapshot_downloaded",
            clinic_id = %clinic_id,
            snapshot_id = %snapshot_id,
            bytes = bytes.len()
        );
        Ok(bytes)
    }

    /// Upload and record in the registry. Returns the registry copy of the
    /// metadata, which carries the compressed size.
    pub fn save_snapshot(
        &self,
        metadata: &SnapshotMetadata,
        bytes: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        self.upload(&metadata.clinic_id, &metadata.snapshot_id, bytes)?;

        let mut entry = metadata.clone();
        entry.sizes.compressed_bytes = bytes.len() as u64;

        let mut registry = self.load_registry(&metadata.clinic_id)?;
        registry
            .snapshots
            .retain(|s| s.snapshot_id != entry.snapshot_id);
        registry.snapshots.insert(0, entry.clone());

        let evicted: Vec<SnapshotMetadata> = if registry.snapshots.len() > self.max_snapshots_per_clinic
        {
            registry.snapshots.split_off(self.max_snapshots_per_clinic)
        } else {
            Vec::new()
        };
        self.write_registry(&metadata.clinic_id, &mut registry)?;

        for old in evicted {
            self.remove_object_logged(&old.clinic_id, &old.snapshot_id, "retention_count");
        }
        Ok(entry)
    }

    pub fn list_snapshots(&self, clinic_id: &str) -> Result<Vec<SnapshotMetadata>, StorageError> {
        Ok(self.load_registry(clinic_id)?.snapshots)
    }

    pub fn get_metadata(
        &self,
        clinic_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<SnapshotMetadata>, StorageError> {
        Ok(self
            .load_registry(clinic_id)?
            .snapshots
            .into_iter()
            .find(|s| s.snapshot_id == snapshot_id))
    }

    /// Remove the object and its registry entry. `NotFound` when neither existed.
    pub fn delete_snapshot(&self, clinic_id: &str, snapshot_id: &str) -> Result<(), StorageError> {
        let key = snapshot_key(clinic_id, snapshot_id)?;
        let removed_object = self.store.remove(&key)?;

        let mut registry = self.load_registry(clinic_id)?;
        let before = registry.snapshots.len();
        registry.snapshots.retain(|s| s.snapshot_id != snapshot_id);
        let removed_entry = registry.snapshots.len() != before;
        if removed_entry {
            self.write_registry(clinic_id, &mut registry)?;
        }

        if !removed_object && !removed_entry {
            return Err(StorageError::NotFound { key });
        }
        info!(
            target: LOG_TARGET,
            event = "snapshot_deleted",
            clinic_id = %clinic_id,
            snapshot_id = %snapshot_id
        );
        Ok(())
    }

    pub fn storage_usage(&self, clinic_id: &str) -> Result<StorageUsage, StorageError> {
        let registry = self.load_registry(clinic_id)?;
        Ok(StorageUsage {
            total_bytes: registry
                .snapshots
                .iter()
                .map(|s| s.sizes.compressed_bytes)
                .sum(),
            snapshot_count: registry.snapshots.len(),
        })
    }

    /// Drop snapshots older than the retention window. Entries with an
    /// unparseable `createdAt` are kept.
    pub fn cleanup_expired(
        &self,
        clinic_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let cutoff = now - ChronoDuration::days(self.retention_days);
        let mut registry = self.load_registry(clinic_id)?;
        let (expired, kept): (Vec<_>, Vec<_>) =
            registry.snapshots.into_iter().partition(|s| {
                DateTime::parse_from_rfc3339(&s.created_at)
                    .map(|t| t.with_timezone(&Utc) < cutoff)
                    .unwrap_or(false)
            });
        registry.snapshots = kept;
        if expired.is_empty() {
            return Ok(0);
        }
        self.write_registry(clinic_id, &mut registry)?;
        for old in &expired {
            self.remove_object_logged(clinic_id, &old.snapshot_id, "retention_age");
        }
        info!(
            target: LOG_TARGET,
            event = "snapshot_cleanup",
            clinic_id = %clinic_id,
            removed = expired.len()
        );
        Ok(expired.len())
    }

    fn remove_object_logged(&self, clinic_id: &str, snapshot_id: &str, reason: &'static str) {
        let result = snapshot_key(clinic_id, snapshot_id).and_then(|key| self.store.remove(&key));
        match result {
            Ok(_) => info!(
                target: LOG_TARGET,
                event = "snapshot_evicted",
                clinic_id = %clinic_id,
                snapshot_id = %snapshot_id,
                reason
            ),
            Err(err) => warn!(
                target: LOG_TARGET,
                event = "snapshot_evict_failed",
                clinic_id = %clinic_id,
                snapshot_id = %snapshot_id,
                reason,
                error = %err
            ),
        }
    }

    fn load_registry(&self, clinic_id: &str) -> Result<SnapshotRegistry, StorageError> {
        let key = registry_key(clinic_id)?;
        match self.store.get(&key) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| StorageError::Corrupt {
                key,
                reason: err.to_string(),
            }),
            Err(StorageError::NotFound { .. }) => Ok(SnapshotRegistry::default()),
            Err(err) => Err(err),
        }
    }

    fn write_registry(
        &self,
        clinic_id: &str,
        registry: &mut SnapshotRegistry,
    ) -> Result<(), StorageError> {
        let key = registry_key(clinic_id)?;
        registry.updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let bytes = serde_json::to_vec_pretty(registry).map_err(|err| StorageError::Io {
            operation: "put",
            key: key.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })?;
        self.store.put(&key, &bytes, true)
    }
}
