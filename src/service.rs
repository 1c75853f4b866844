//! One object per process wiring discovery, export, storage, restore and
//! import together, returning the response DTOs callers see.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Clock, SnapshotCache, SystemClock};
use crate::config::SnapshotConfig;
use crate::discovery::{DiscoverySummary, TableDescriptor, TableDiscoveryService};
use crate::error::{codes, AppError, AppResult};
use crate::export::{ExportRequest, SnapshotExporter};
use crate::import::{
    BundleValidator, ImportOptions, OperationResult, RestoreMode, RestoreOptions,
    SnapshotRestorer, ValidationResult, WorkspaceBundleImporter,
};
use crate::snapshot::{pack_bundle, read_bundle_value, CreatedBy, SnapshotMetadata, SnapshotType};
use crate::storage::{FsSnapshotStore, SnapshotStorageService, SnapshotStore, StorageUsage};
use crate::LOG_TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

/// Caller identity, verified upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub user_email: String,
    pub role: Role,
}

impl Identity {
    fn created_by(&self) -> CreatedBy {
        CreatedBy {
            user_id: self.user_id.clone(),
            email: self.user_email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverTablesResponse {
    pub tables: Vec<TableDescriptor>,
    pub foreign_key_order: Vec<String>,
    pub discovered_at: String,
    pub summary: DiscoverySummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub total_records: u64,
    pub records_by_table: BTreeMap<String, u64>,
    pub compressed_size_bytes: u64,
    pub uncompressed_size_bytes: u64,
    pub export_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotResponse {
    pub snapshot_id: String,
    pub stats: SnapshotStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsResponse {
    pub snapshots: Vec<SnapshotMetadata>,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSnapshotRequest {
    #[serde(default)]
    pub mode: RestoreMode,
    #[serde(default = "default_true")]
    pub create_backup_first: bool,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RestoreSnapshotRequest {
    fn default() -> Self {
        Self {
            mode: RestoreMode::Replace,
            create_backup_first: true,
            tables: None,
            dry_run: false,
            skip_validation: false,
            overwrite: false,
        }
    }
}

impl From<&RestoreSnapshotRequest> for RestoreOptions {
    fn from(request: &RestoreSnapshotRequest) -> Self {
        RestoreOptions {
            mode: request.mode,
            create_backup_first: request.create_backup_first,
            tables: request.tables.clone(),
            dry_run: request.dry_run,
            skip_validation: request.skip_validation,
            overwrite: request.overwrite,
        }
    }
}

pub struct SnapshotService {
    config: SnapshotConfig,
    discovery: Arc<TableDiscoveryService>,
    exporter: Arc<SnapshotExporter>,
    storage: SnapshotStorageService,
    validator: BundleValidator,
    restorer: SnapshotRestorer,
    importer: WorkspaceBundleImporter,
    listings: Arc<SnapshotCache<Vec<SnapshotMetadata>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotService {
    pub fn new(pool: SqlitePool, store: Arc<dyn SnapshotStore>, config: SnapshotConfig) -> Self {
        Self::with_clock(pool, store, config, Arc::new(SystemClock))
    }

    /// Service whose listing cache expires by `clock`. Inside a tokio
    /// runtime the expired entries are swept every
    /// `config.cache_cleanup_interval` until the service is dropped.
    pub fn with_clock(
        pool: SqlitePool,
        store: Arc<dyn SnapshotStore>,
        config: SnapshotConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let discovery = Arc::new(TableDiscoveryService::new(pool.clone()));
        let exporter = Arc::new(SnapshotExporter::new(
            pool.clone(),
            discovery.clone(),
            config.lookup_chunk_size,
        ));
        let storage = SnapshotStorageService::new(
            store,
            config.max_snapshots_per_clinic,
            config.retention_days,
            config.max_bundle_bytes,
        );
        let restorer = SnapshotRestorer::new(
            pool.clone(),
            discovery.clone(),
            exporter.clone(),
            storage.clone(),
            &config,
        );
        let importer = WorkspaceBundleImporter::new(pool, discovery.clone(), &config);
        let listings = Arc::new(SnapshotCache::with_clock(clock));
        let cleanup_task = tokio::runtime::Handle::try_current()
            .ok()
            .map(|_| listings.spawn_cleanup(config.cache_cleanup_interval));
        if cleanup_task.is_none() {
            debug!(target: LOG_TARGET, event = "cache_cleanup_not_scheduled");
        }
        Self {
            discovery,
            exporter,
            storage,
            validator: BundleValidator::new(),
            restorer,
            importer,
            listings,
            cleanup_task: Mutex::new(cleanup_task),
            config,
        }
    }

    /// Stop the background cache sweep. Also runs on drop.
    pub fn shutdown(&self) {
        let task = self.cleanup_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
            debug!(target: LOG_TARGET, event = "cache_cleanup_stopped");
        }
    }

    /// Service backed by the filesystem store under `config.bucket_dir()`.
    pub fn with_fs_store(pool: SqlitePool, config: SnapshotConfig) -> Self {
        let store = Arc::new(FsSnapshotStore::new(config.bucket_dir()));
        Self::new(pool, store, config)
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn storage(&self) -> &SnapshotStorageService {
        &self.storage
    }

    pub fn listing_cache(&self) -> &Arc<SnapshotCache<Vec<SnapshotMetadata>>> {
        &self.listings
    }

    fn require(&self, identity: &Identity, minimum: Role, action: &str) -> AppResult<()> {
        if !self.config.enforce_roles || identity.role >= minimum {
            return Ok(());
        }
        warn!(
            target: LOG_TARGET,
            event = "permission_denied",
            user_id = %identity.user_id,
            role = identity.role.as_str(),
            action
        );
        Err(AppError::new(
            codes::PERMISSION_DENIED,
            format!("{action} requires the {} role", minimum.as_str()),
        )
        .with_context("role", identity.role.as_str()))
    }

    pub async fn discover_tables(&self, force_refresh: bool) -> AppResult<DiscoverTablesResponse> {
        let result = self.discovery.discover(force_refresh).await?;
        Ok(DiscoverTablesResponse {
            tables: result.tables.clone(),
            foreign_key_order: result.foreign_key_order.clone(),
            discovered_at: result.discovered_at.clone(),
            summary: result.summary(),
        })
    }

    pub async fn create_snapshot(
        &self,
        clinic_id: &str,
        snapshot_type: SnapshotType,
        identity: &Identity,
    ) -> AppResult<CreateSnapshotResponse> {
        self.require(identity, Role::Editor, "creating a snapshot")?;
        let started = Instant::now();
        let bundle = self
            .exporter
            .export(&ExportRequest {
                clinic_id: clinic_id.to_string(),
                snapshot_type,
                created_by: identity.created_by(),
            })
            .await?;
        let packed = pack_bundle(&bundle, self.config.max_bundle_bytes)?;
        let uncompressed_bytes = packed.uncompressed_bytes;
        let (metadata, bytes) = (bundle.metadata, packed.bytes);
        let saved = self
            .storage
            .blocking(move |s| s.save_snapshot(&metadata, &bytes))
            .await?;
        self.listings.invalidate(clinic_id);

        info!(
            target: LOG_TARGET,
            event = "snapshot_created",
            clinic_id = %clinic_id,
            snapshot_id = %saved.snapshot_id,
            records = saved.total_records(),
            compressed_bytes = saved.sizes.compressed_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        Ok(CreateSnapshotResponse {
            snapshot_id: saved.snapshot_id.clone(),
            stats: SnapshotStats {
                total_records: saved.total_records(),
                records_by_table: saved.record_counts.clone(),
                compressed_size_bytes: saved.sizes.compressed_bytes,
                uncompressed_size_bytes: uncompressed_bytes,
                export_duration_ms: saved.duration_ms,
            },
        })
    }

    pub async fn list_snapshots(&self, clinic_id: &str) -> AppResult<ListSnapshotsResponse> {
        let storage = self.storage.clone();
        let id = clinic_id.to_string();
        let snapshots = self
            .listings
            .get_or_load(clinic_id, self.config.cache_ttl, || async move {
                storage.blocking(move |s| s.list_snapshots(&id)).await
            })
            .await?;
        Ok(ListSnapshotsResponse {
            total_count: snapshots.len(),
            snapshots: snapshots.as_ref().clone(),
        })
    }

    pub async fn delete_snapshot(&self, clinic_id: &str, snapshot_id: &str) -> AppResult<()> {
        let (clinic, snapshot) = (clinic_id.to_string(), snapshot_id.to_string());
        self.storage
            .blocking(move |s| s.delete_snapshot(&clinic, &snapshot))
            .await?;
        self.listings.invalidate(clinic_id);
        Ok(())
    }

    pub async fn storage_usage(&self, clinic_id: &str) -> AppResult<StorageUsage> {
        let clinic = clinic_id.to_string();
        Ok(self.storage.blocking(move |s| s.storage_usage(&clinic)).await?)
    }

    /// Validate packed or plain JSON bundle bytes without touching the database.
    pub fn validate_bundle_bytes(&self, bytes: &[u8]) -> AppResult<ValidationResult> {
        let (value, _) = read_bundle_value(bytes, self.config.max_bundle_bytes)?;
        Ok(self.validator.validate_value(&value))
    }

    /// Restore a stored snapshot into its own clinic. Download and permission
    /// problems are errors; everything after that is reported in the result.
    pub async fn restore_snapshot(
        &self,
        clinic_id: &str,
        snapshot_id: &str,
        request: &RestoreSnapshotRequest,
        identity: &Identity,
    ) -> AppResult<OperationResult> {
        self.require(identity, Role::Admin, "restoring a snapshot")?;
        let (clinic, snapshot) = (clinic_id.to_string(), snapshot_id.to_string());
        let bytes = self
            .storage
            .blocking(move |s| s.download(&clinic, &snapshot))
            .await?;
        let options = RestoreOptions::from(request);
        let result = self
            .restorer
            .restore(&bytes, clinic_id, &identity.created_by(), &options)
            .await;
        if !options.dry_run {
            self.listings.invalidate(clinic_id);
        }
        Ok(result)
    }

    /// Import bundle bytes into a new clinic. The identity, when given,
    /// becomes the owner of a newly created workspace.
    pub async fn import_bundle(
        &self,
        bytes: &[u8],
        options: &ImportOptions,
        identity: Option<&Identity>,
    ) -> AppResult<OperationResult> {
        let mut options = options.clone();
        if let Some(identity) = identity {
            self.require(identity, Role::Admin, "importing a bundle")?;
            if options.user_id.is_empty() {
                options.user_id = identity.user_id.clone();
            }
            if options.user_email.is_empty() {
                options.user_email = identity.user_email.clone();
            }
        } else if self.config.enforce_roles {
            return Err(AppError::new(
                codes::PERMISSION_DENIED,
                "importing a bundle requires an identity",
            ));
        }
        Ok(self.importer.import(bytes, &options).await)
    }

    /// Apply age-based retention for one clinic.
    pub async fn cleanup(&self, clinic_id: &str) -> AppResult<usize> {
        let clinic = clinic_id.to_string();
        let removed = self
            .storage
            .blocking(move |s| s.cleanup_expired(&clinic, Utc::now()))
            .await?;
        if removed > 0 {
            self.listings.invalidate(clinic_id);
        }
        Ok(removed)
    }

    /// Drop cached discovery and listings, e.g. after a live schema change.
    pub async fn invalidate_caches(&self) {
        self.discovery.invalidate().await;
        self.listings.invalidate_all();
    }
}

impl Drop for SnapshotService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_are_ordered_by_privilege() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::Editor);
        assert!(Role::Editor > Role::Viewer);
    }

    #[test]
    fn restore_request_defaults() {
        let request: RestoreSnapshotRequest =
            serde_json::from_value(json!({"tables": ["patients"]})).unwrap();
        assert_eq!(request.mode, RestoreMode::Replace);
        assert!(request.create_backup_first);
        let options = RestoreOptions::from(&request);
        assert_eq!(options.tables.as_deref(), Some(&["patients".to_string()][..]));
        assert!(!options.dry_run);
    }
}
