//! Getting bundles back into the database: validation, bundle migration,
//! same-clinic restore and cross-workspace import.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod migrations;
pub mod report;
pub mod restore;
pub mod validator;
pub mod workspace;
mod writer;

pub use migrations::{
    MigrateOptions, MigrationError, MigrationPreview, MigrationReport, Migrator,
    CURRENT_SCHEMA_VERSION, MIN_SUPPORTED_SCHEMA_VERSION,
};
pub use report::write_operation_report;
pub use restore::{RestoreError, SnapshotRestorer};
pub use validator::{BundleValidator, ValidationError, ValidationResult};
pub use workspace::{ImportError, WorkspaceBundleImporter};

pub const MIN_SUPPORTED_APP_VERSION: &str = "0.1.0";

/// Throughput assumed when estimating how long a load will take.
pub(crate) const ROWS_PER_SECOND: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub message: String,
    pub fatal: bool,
}

/// Outcome of a restore or import. Always produced, even when the operation
/// failed before writing anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub restored_or_imported_records: BTreeMap<String, u64>,
    pub skipped_records: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deleted_records: BTreeMap<String, u64>,
    pub errors: Vec<OperationError>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore_snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_ids: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl OperationResult {
    pub(crate) fn started(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }

    pub fn total_written(&self) -> u64 {
        self.restored_or_imported_records.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_records.values().sum()
    }

    pub(crate) fn fatal(&mut self, table: Option<&str>, message: impl Into<String>) {
        self.errors.push(OperationError {
            table: table.map(str::to_string),
            message: message.into(),
            fatal: true,
        });
    }

    pub(crate) fn error(&mut self, table: Option<&str>, message: impl Into<String>) {
        self.errors.push(OperationError {
            table: table.map(str::to_string),
            message: message.into(),
            fatal: false,
        });
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub(crate) fn add_written(&mut self, table: &str, n: u64) {
        *self
            .restored_or_imported_records
            .entry(table.to_string())
            .or_default() += n;
    }

    pub(crate) fn add_skipped(&mut self, table: &str, n: u64) {
        if n > 0 {
            *self.skipped_records.entry(table.to_string()).or_default() += n;
        }
    }

    /// Success means no fatal error was recorded.
    pub(crate) fn finish(mut self, started: std::time::Instant) -> Self {
        self.success = !self.has_fatal_error();
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    #[default]
    Replace,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    pub create_backup_first: bool,
    pub tables: Option<Vec<String>>,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub overwrite: bool,
}

impl Default for RestoreOptions {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Create,
    Merge,
    Replace,
}

impl ImportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportMode::Create => "create",
            ImportMode::Merge => "merge",
            ImportMode::Replace => "replace",
        }
    }
}

/// `overwrite` and `create_backup_first` are accepted for shape parity with
/// restore; an import always lands in a fresh clinic, so neither applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    pub mode: ImportMode,
    pub target_workspace_id: Option<String>,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub overwrite: bool,
    pub create_backup_first: bool,
    pub tables: Option<Vec<String>>,
    pub user_id: String,
    pub user_email: String,
    pub cleanup_on_failure: bool,
}

/// Whether `table` passes the caller's table filter.
pub(crate) fn table_selected(filter: Option<&[String]>, table: &str) -> bool {
    filter.map(|t| t.iter().any(|n| n == table)).unwrap_or(true)
}
