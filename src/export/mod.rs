use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{bind_json, placeholders, quote_ident, row_to_value};
use crate::discovery::{
    DiscoveryError, DiscoveryResult, TableCategory, TableDescriptor, TableDiscoveryService,
    TENANT_COLUMN,
};
use crate::error::{codes, AppError};
use crate::import::migrations::CURRENT_SCHEMA_VERSION;
use crate::snapshot::{
    compute_checksums, CreatedBy, SnapshotBundle, SnapshotMetadata, SnapshotSizes, SnapshotType,
};
use crate::{migrate, APP_VERSION, LOG_TARGET};

pub mod manifest;

use self::manifest::build_manifest;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("clinic {0} not found")]
    ClinicNotFound(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to read table {table}: {source}")]
    TableRead {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to read schema version: {0}")]
    SchemaVersion(String),
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::ClinicNotFound(id) => {
                AppError::new(codes::NOT_FOUND, format!("Clinic {id} not found"))
                    .with_context("clinic_id", id)
            }
            ExportError::Discovery(inner) => AppError::from(inner),
            ExportError::TableRead { table, source } => {
                AppError::new(codes::EXPORT_FAILED, format!("Failed to read table {table}"))
                    .with_context("table", table)
                    .with_cause(AppError::from(source))
            }
            other => AppError::new(codes::EXPORT_FAILED, other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub clinic_id: String,
    pub snapshot_type: SnapshotType,
    pub created_by: CreatedBy,
}

struct ClinicInfo {
    name: String,
    workspace_id: String,
    workspace_name: String,
}

/// Reads every tenant table of one clinic into a checksummed bundle.
pub struct SnapshotExporter {
    pool: SqlitePool,
    discovery: Arc<TableDiscoveryService>,
    lookup_chunk_size: usize,
}

impl SnapshotExporter {
    pub fn new(
        pool: SqlitePool,
        discovery: Arc<TableDiscoveryService>,
        lookup_chunk_size: usize,
    ) -> Self {
        Self {
            pool,
            discovery,
            lookup_chunk_size: lookup_chunk_size.max(1),
        }
    }

    /// Export `request.clinic_id`. Any table read failure aborts the whole
    /// export; no partial bundle is ever returned.
    pub async fn export(&self, request: &ExportRequest) -> Result<SnapshotBundle, ExportError> {
        let started = Instant::now();
        let clinic = self.load_clinic(&request.clinic_id).await?;
        let discovery = self.discovery.discover_clinic_tables().await?;

        let mut data: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for name in &discovery.foreign_key_order {
            let Some(table) = discovery.get(name) else { continue };
            let rows = match self.read_table(table, &request.clinic_id, &data).await {
                Ok(rows) => rows,
                Err(source) => {
                    warn!(
                        target: LOG_TARGET,
                        event = "export_table_failed",
                        clinic_id = %request.clinic_id,
                        table = %name,
                        error = %source
                    );
                    return Err(ExportError::TableRead {
                        table: name.clone(),
                        source,
                    });
                }
            };
            info!(
                target: LOG_TARGET,
                event = "export_table",
                clinic_id = %request.clinic_id,
                table = %name,
                category = table.category.as_str(),
                rows = rows.len()
            );
            data.insert(name.clone(), rows);
        }

        self.export_side_tables(&discovery, &request.clinic_id, &mut data)
            .await?;

        let schema_version = match migrate::current_schema_version(&self.pool).await {
            Ok(0) => CURRENT_SCHEMA_VERSION,
            Ok(v) => v,
            Err(err) => return Err(ExportError::SchemaVersion(err.to_string())),
        };

        let checksums = compute_checksums(&data);
        let manifest = build_manifest(&discovery, &data, &checksums);
        let record_counts = data
            .iter()
            .map(|(table, rows)| (table.clone(), rows.len() as u64))
            .collect();

        let mut bundle = SnapshotBundle {
            metadata: SnapshotMetadata {
                snapshot_id: Uuid::now_v7().to_string(),
                clinic_id: request.clinic_id.clone(),
                workspace_id: clinic.workspace_id,
                clinic_name: clinic.name,
                workspace_name: clinic.workspace_name,
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                created_by: request.created_by.clone(),
                snapshot_type: request.snapshot_type,
                schema_version,
                app_version: APP_VERSION.to_string(),
                record_counts,
                checksums,
                sizes: SnapshotSizes::default(),
                duration_ms: 0,
            },
            manifest,
            data,
        };

        bundle.metadata.duration_ms = started.elapsed().as_millis() as u64;
        let serialized_len = serde_json::to_vec(&bundle)
            .map(|v| v.len() as u64)
            .unwrap_or_default();
        bundle.metadata.sizes.uncompressed_bytes = serialized_len;

        info!(
            target: LOG_TARGET,
            event = "export_complete",
            clinic_id = %request.clinic_id,
            snapshot_id = %bundle.metadata.snapshot_id,
            snapshot_type = bundle.metadata.snapshot_type.as_str(),
            tables = bundle.data.len(),
            records = bundle.total_records(),
            elapsed_ms = bundle.metadata.duration_ms
        );
        Ok(bundle)
    }

    async fn load_clinic(&self, clinic_id: &str) -> Result<ClinicInfo, ExportError> {
        let row = sqlx::query(
            "SELECT c.name AS name, c.workspace_id AS workspace_id, w.name AS workspace_name \
             FROM clinics c LEFT JOIN workspaces w ON w.id = c.workspace_id WHERE c.id = ?1",
        )
        .bind(clinic_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ExportError::ClinicNotFound(clinic_id.to_string()))?;

        Ok(ClinicInfo {
            name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            workspace_id: row
                .try_get::<Option<String>, _>("workspace_id")?
                .unwrap_or_default(),
            workspace_name: row
                .try_get::<Option<String>, _>("workspace_name")?
                .unwrap_or_default(),
        })
    }

    async fn read_table(
        &self,
        table: &TableDescriptor,
        clinic_id: &str,
        exported: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<Value>, sqlx::Error> {
        match table.category {
            TableCategory::Direct | TableCategory::Hybrid => {
                // `= ?` never matches NULL, so global hybrid rows stay out.
                let sql = format!(
                    "SELECT * FROM {} WHERE {} = ?1{}",
                    quote_ident(&table.name),
                    quote_ident(TENANT_COLUMN),
                    order_clause(table)
                );
                let rows = sqlx::query(&sql)
                    .bind(clinic_id)
                    .fetch_all(&self.pool)
                    .await?;
                rows.iter()
                    .map(|r| row_to_value(r).map(Value::Object))
                    .collect()
            }
            TableCategory::Indirect => {
                let (Some(parent), Some(column), Some(key)) = (
                    table.parent_table.as_deref(),
                    table.parent_column.as_deref(),
                    table.parent_key.as_deref(),
                ) else {
                    return Ok(Vec::new());
                };
                let parent_ids = collect_values(exported.get(parent), key);
                self.read_by_parent(table, column, &parent_ids).await
            }
        }
    }

    /// Batched `IN (...)` lookups, one query per chunk of parent ids.
    async fn read_by_parent(
        &self,
        table: &TableDescriptor,
        column: &str,
        parent_ids: &[Value],
    ) -> Result<Vec<Value>, sqlx::Error> {
        let mut out = Vec::new();
        for chunk in parent_ids.chunks(self.lookup_chunk_size) {
            let sql = format!(
                "SELECT * FROM {} WHERE {} IN ({}){}",
                quote_ident(&table.name),
                quote_ident(column),
                placeholders(chunk.len()),
                order_clause(table)
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = bind_json(query, id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                out.push(Value::Object(row_to_value(row)?));
            }
        }
        Ok(out)
    }

    async fn export_side_tables(
        &self,
        discovery: &DiscoveryResult,
        clinic_id: &str,
        data: &mut BTreeMap<String, Vec<Value>>,
    ) -> Result<(), ExportError> {
        for side in &discovery.side_tables {
            let (Some(source), Some(column), Some(key)) = (
                side.parent_table.as_deref(),
                side.parent_column.as_deref(),
                side.parent_key.as_deref(),
            ) else {
                continue;
            };
            if !data.contains_key(source) {
                continue;
            }
            let ids = collect_values(data.get(source), key);
            let rows = self
                .read_by_parent(side, column, &ids)
                .await
                .map_err(|source| ExportError::TableRead {
                    table: side.name.clone(),
                    source,
                })?;
            info!(
                target: LOG_TARGET,
                event = "export_side_table",
                clinic_id = %clinic_id,
                table = %side.name,
                rows = rows.len()
            );
            data.insert(side.name.clone(), rows);
        }
        Ok(())
    }
}

fn order_clause(table: &TableDescriptor) -> String {
    if table.primary_key.is_empty() {
        String::new()
    } else {
        let cols: Vec<String> = table.primary_key.iter().map(|c| quote_ident(c)).collect();
        format!(" ORDER BY {}", cols.join(", "))
    }
}

/// Distinct non-null values of `key` across `rows`, first-seen order.
pub(crate) fn collect_values(rows: Option<&Vec<Value>>, key: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .flatten()
        .filter_map(|row| row.get(key))
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(v.to_string()))
        .cloned()
        .collect()
}
