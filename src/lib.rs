//! Clinic data snapshot engine: discovers tenant tables, exports clinics as
//! checksummed bundles, stores them, and validates, migrates, restores or
//! imports them again.

pub mod cache;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod migrate;
pub mod service;
pub mod snapshot;
pub mod storage;

pub use cache::{CacheStats, Clock, ManualClock, SnapshotCache, SystemClock};
pub use config::SnapshotConfig;
pub use discovery::{
    DiscoveryError, DiscoveryResult, TableCategory, TableDescriptor, TableDiscoveryService,
};
pub use error::{AppError, AppResult};
pub use export::{ExportError, ExportRequest, SnapshotExporter};
pub use import::{
    BundleValidator, ImportMode, ImportOptions, Migrator, OperationResult, RestoreMode,
    RestoreOptions, SnapshotRestorer, ValidationResult, WorkspaceBundleImporter,
};
pub use service::{Identity, Role, SnapshotService};
pub use snapshot::{SnapshotBundle, SnapshotMetadata, SnapshotType};
pub use storage::{
    FsSnapshotStore, MemorySnapshotStore, SnapshotStorageService, SnapshotStore, StorageError,
};

/// Tracing target shared by every event this crate emits.
pub const LOG_TARGET: &str = "clinic_snapshot";

/// Version stamped into exported bundles.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit the binary was built from, or `unknown`.
pub const GIT_HASH: &str = env!("CLINIC_SNAPSHOT_GIT_HASH");
