use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::migrations::{MigrationError, Migrator};
use super::validator::{BundleValidator, ValidationError};
use super::writer::{delete_where_in, global_keys, key_string, project_row, ChunkedTx, Conflict, RowInserter};
use super::{table_selected, ImportMode, ImportOptions, OperationResult};
use crate::config::SnapshotConfig;
use crate::db::{classify_write_error, run_in_tx, WriteFailure};
use crate::discovery::{
    DiscoveryError, DiscoveryResult, TableCategory, TableDescriptor, TableDiscoveryService,
    TENANT_COLUMN, WORKSPACE_COLUMN,
};
use crate::error::{codes, AppError};
use crate::snapshot::{read_bundle_value, CodecError, SnapshotBundle};
use crate::LOG_TARGET;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("bundle could not be read: {0}")]
    Unreadable(#[from] CodecError),
    #[error("bundle does not parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("import mode replace is not supported; restore into the source clinic instead")]
    ReplaceUnsupported,
    #[error("merge import needs a target workspace id")]
    MissingTargetWorkspace,
    #[error("workspace {0} not found")]
    WorkspaceNotFound(String),
    #[error("failed to create destination workspace or clinic: {0}")]
    Provision(#[source] sqlx::Error),
    #[error("write to {table} failed: {source}")]
    Write {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Validation(inner) => inner.into(),
            ImportError::Migration(inner) => inner.into(),
            ImportError::Discovery(inner) => inner.into(),
            ImportError::Unreadable(_) | ImportError::Parse(_) => {
                AppError::new(codes::INVALID_SNAPSHOT, err.to_string())
            }
            ImportError::WorkspaceNotFound(id) => {
                AppError::new(codes::NOT_FOUND, format!("Workspace {id} not found"))
                    .with_context("workspace_id", id)
            }
            ImportError::Write { table, source } => {
                AppError::new(codes::IMPORT_FAILED, format!("Write to {table} failed"))
                    .with_context("table", table)
                    .with_cause(AppError::from(source))
            }
            other => AppError::new(codes::IMPORT_FAILED, other.to_string()),
        }
    }
}

/// Old id to new id, per table.
#[derive(Debug, Default)]
struct IdRemap {
    map: HashMap<(String, String), Value>,
}

impl IdRemap {
    fn insert(&mut self, table: &str, old: &Value, new: Value) {
        self.map.insert((table.to_string(), key_string(old)), new);
    }

    fn get(&self, table: &str, old: &Value) -> Option<&Value> {
        self.map.get(&(table.to_string(), key_string(old)))
    }
}

#[derive(Debug, Clone)]
struct Destination {
    workspace_id: String,
    clinic_id: String,
    clinic_name: String,
    created_workspace: bool,
}

#[derive(Debug, Clone)]
struct NewWorkspace {
    name: String,
    slug: String,
    owner_id: String,
}

async fn insert_destination(
    conn: &mut SqliteConnection,
    destination: &Destination,
    workspace: Option<&NewWorkspace>,
) -> Result<(), sqlx::Error> {
    if let Some(ws) = workspace {
        sqlx::query("INSERT INTO workspaces (id, name, slug, owner_id) VALUES (?1, ?2, ?3, ?4)")
            .bind(&destination.workspace_id)
            .bind(&ws.name)
            .bind(&ws.slug)
            .bind(&ws.owner_id)
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query("INSERT INTO clinics (id, workspace_id, name) VALUES (?1, ?2, ?3)")
        .bind(&destination.clinic_id)
        .bind(&destination.workspace_id)
        .bind(&destination.clinic_name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Rows written so far, for the compensating cleanup.
#[derive(Default)]
struct ImportState {
    destination: Option<Destination>,
    inserted: Vec<(String, String, Vec<Value>)>,
}

struct RemapContext<'a> {
    discovery: &'a DiscoveryResult,
    clinic_id: &'a str,
    workspace_id: &'a str,
    globals: &'a HashMap<String, HashSet<String>>,
}

enum Remapped {
    Row {
        row: Map<String, Value>,
        old_key: Option<Value>,
        new_key: Option<Value>,
    },
    Skip(String),
}

/// Columns pointing at another table: declared FKs plus the indirect or
/// side-table parent link.
fn links(table: &TableDescriptor) -> Vec<(String, String)> {
    let mut links: Vec<(String, String)> = table
        .foreign_keys
        .iter()
        .map(|fk| (fk.column.clone(), fk.table.clone()))
        .collect();
    if let (Some(parent), Some(column)) = (&table.parent_table, &table.parent_column) {
        if !links.iter().any(|(c, _)| c == column) {
            links.push((column.clone(), parent.clone()));
        }
    }
    links
}

fn remap_row(
    ctx: &RemapContext<'_>,
    table: &TableDescriptor,
    row: &Map<String, Value>,
    remap: &IdRemap,
    dropped: &mut BTreeSet<String>,
    nulled: &mut BTreeMap<String, u64>,
) -> Remapped {
    let mut out = project_row(row, table, dropped);

    if table.has_column(TENANT_COLUMN) {
        let shared = out.get(TENANT_COLUMN).map(Value::is_null).unwrap_or(true);
        if shared && table.category == TableCategory::Hybrid {
            return Remapped::Skip("shared row".to_string());
        }
        out.insert(TENANT_COLUMN.to_string(), Value::from(ctx.clinic_id));
    }
    if table.has_column(WORKSPACE_COLUMN) {
        out.insert(WORKSPACE_COLUMN.to_string(), Value::from(ctx.workspace_id));
    }

    let links = links(table);
    for (column, parent) in &links {
        if column == TENANT_COLUMN || column == WORKSPACE_COLUMN {
            continue;
        }
        let Some(old) = out.get(column).filter(|v| !v.is_null()).cloned() else {
            continue;
        };
        match parent.as_str() {
            "clinics" => {
                out.insert(column.clone(), Value::from(ctx.clinic_id));
                continue;
            }
            "workspaces" => {
                out.insert(column.clone(), Value::from(ctx.workspace_id));
                continue;
            }
            _ => {}
        }
        // References to global tables are kept as they are.
        if ctx.discovery.get(parent).is_none() {
            continue;
        }
        if let Some(new) = remap.get(parent, &old) {
            out.insert(column.clone(), new.clone());
            continue;
        }
        let is_global = ctx
            .globals
            .get(parent)
            .map(|keys| keys.contains(&key_string(&old)))
            .unwrap_or(false);
        if is_global {
            continue;
        }
        let nullable = table.column(column).map(|c| !c.not_null).unwrap_or(true);
        if nullable {
            out.insert(column.clone(), Value::Null);
            *nulled.entry(column.clone()).or_default() += 1;
        } else {
            return Remapped::Skip(format!(
                "{column} references {parent} {} which was not imported",
                key_string(&old)
            ));
        }
    }

    let (old_key, new_key) = match table.single_pk() {
        Some(pk) if links.iter().any(|(c, _)| c == pk) => (None, None),
        Some(pk) if table.has_integer_pk() => (out.remove(pk).filter(|v| !v.is_null()), None),
        Some(pk) => {
            let old = out.get(pk).filter(|v| !v.is_null()).cloned();
            let new = Value::from(Uuid::new_v4().to_string());
            out.insert(pk.to_string(), new.clone());
            (old, Some(new))
        }
        None => (None, None),
    };

    Remapped::Row {
        row: out,
        old_key,
        new_key,
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "workspace".to_string()
    } else {
        slug.to_string()
    }
}

/// Loads a bundle into a new clinic, in a new or existing workspace, with
/// every id rewritten so nothing collides with data already present.
pub struct WorkspaceBundleImporter {
    pool: SqlitePool,
    discovery: Arc<TableDiscoveryService>,
    validator: BundleValidator,
    migrator: Migrator,
    insert_chunk_size: usize,
    lookup_chunk_size: usize,
    max_bundle_bytes: u64,
}

impl WorkspaceBundleImporter {
    pub fn new(
        pool: SqlitePool,
        discovery: Arc<TableDiscoveryService>,
        config: &SnapshotConfig,
    ) -> Self {
        Self {
            pool,
            discovery,
            validator: BundleValidator::new(),
            migrator: Migrator::new(),
            insert_chunk_size: config.insert_chunk_size.max(1),
            lookup_chunk_size: config.lookup_chunk_size.max(1),
            max_bundle_bytes: config.max_bundle_bytes,
        }
    }

    /// Import packed (or plain JSON) bundle bytes. A failure part-way leaves
    /// the rows already written unless `cleanup_on_failure` is set.
    pub async fn import(&self, bytes: &[u8], options: &ImportOptions) -> OperationResult {
        let started = Instant::now();
        info!(
            target: LOG_TARGET,
            event = "import_started",
            mode = options.mode.as_str(),
            dry_run = options.dry_run,
            bytes = bytes.len()
        );
        let mut result = OperationResult::started(options.dry_run);
        let mut state = ImportState::default();
        if let Err(err) = self.run(bytes, options, &mut result, &mut state).await {
            warn!(target: LOG_TARGET, event = "import_failed", error = %err);
            let table = match &err {
                ImportError::Write { table, .. } => Some(table.as_str()),
                _ => None,
            };
            result.fatal(table, err.to_string());
            if options.cleanup_on_failure && !options.dry_run {
                self.cleanup(&state, &mut result).await;
            } else if state.destination.is_some() {
                result.warn("partial import left in place; inspect or delete the new clinic");
            }
        }
        let result = result.finish(started);
        info!(
            target: LOG_TARGET,
            event = "import_complete",
            success = result.success,
            imported = result.total_written(),
            skipped = result.total_skipped(),
            elapsed_ms = result.duration_ms
        );
        result
    }

    async fn run(
        &self,
        bytes: &[u8],
        options: &ImportOptions,
        result: &mut OperationResult,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let (value, _) = read_bundle_value(bytes, self.max_bundle_bytes)?;
        if !options.skip_validation {
            let report = self.validator.validate_value(&value);
            if let Some(err) = ValidationError::from_result(&report) {
                return Err(err.into());
            }
            result
                .warnings
                .extend(report.warnings.into_iter().map(|w| w.message));
        }
        let bundle: SnapshotBundle = serde_json::from_value(value)?;

        let target_workspace = match options.mode {
            ImportMode::Replace => return Err(ImportError::ReplaceUnsupported),
            ImportMode::Create => None,
            ImportMode::Merge => Some(
                options
                    .target_workspace_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or(ImportError::MissingTargetWorkspace)?,
            ),
        };

        let (bundle, migration) = self.migrator.apply_migrations(&bundle)?;
        if !migration.applied.is_empty() {
            result.warn(format!(
                "bundle migrated from schema version {} to {}",
                migration.from_version, migration.to_version
            ));
        }
        result.warnings.extend(migration.warnings);

        let discovery = self.discovery.discover_clinic_tables().await?;

        if let Some(id) = &target_workspace {
            let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM workspaces WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_none() {
                return Err(ImportError::WorkspaceNotFound(id.clone()));
            }
        }

        let mut globals = HashMap::new();
        for table in discovery
            .tables
            .iter()
            .filter(|t| t.category == TableCategory::Hybrid)
        {
            globals.insert(table.name.clone(), global_keys(&self.pool, table).await?);
        }

        let (destination, created) = self.destination_for(&bundle, target_workspace, &options.user_id);
        // A dry run provisions and writes inside one rehearsal transaction
        // that is rolled back at the end.
        let mut tx = if options.dry_run {
            let mut tx = ChunkedTx::rehearsal(&self.pool);
            insert_destination(tx.conn().await?, &destination, created.as_ref())
                .await
                .map_err(ImportError::Provision)?;
            tx
        } else {
            let (dest, new_ws) = (destination.clone(), created.clone());
            run_in_tx(&self.pool, move |tx| {
                Box::pin(async move { insert_destination(&mut **tx, &dest, new_ws.as_ref()).await })
            })
            .await
            .map_err(ImportError::Provision)?;
            info!(
                target: LOG_TARGET,
                event = "import_destination_created",
                workspace_id = %destination.workspace_id,
                clinic_id = %destination.clinic_id,
                created_workspace = destination.created_workspace
            );
            result.workspace_id = Some(destination.workspace_id.clone());
            result.clinic_ids = Some(vec![destination.clinic_id.clone()]);
            ChunkedTx::new(&self.pool, self.insert_chunk_size)
        };
        let ctx = RemapContext {
            discovery: &discovery,
            clinic_id: &destination.clinic_id,
            workspace_id: &destination.workspace_id,
            globals: &globals,
        };
        let order = plan_order(&discovery, &bundle, options, result);

        let outcome = self
            .write(&ctx, &order, &bundle, &mut tx, result, &mut state.inserted)
            .await;
        if !options.dry_run {
            state.destination = Some(destination);
        }
        outcome?;
        tx.finish().await?;
        Ok(())
    }

    /// Fresh ids for the imported clinic, and for its workspace when none was
    /// given.
    fn destination_for(
        &self,
        bundle: &SnapshotBundle,
        target_workspace: Option<String>,
        owner_id: &str,
    ) -> (Destination, Option<NewWorkspace>) {
        let clinic_name = if bundle.metadata.clinic_name.is_empty() {
            "Imported clinic".to_string()
        } else {
            bundle.metadata.clinic_name.clone()
        };
        let created_workspace = target_workspace.is_none();
        let workspace_id = target_workspace.unwrap_or_else(|| Uuid::new_v4().to_string());

        let new_workspace = created_workspace.then(|| {
            let base = if bundle.metadata.workspace_name.is_empty() {
                "Workspace"
            } else {
                bundle.metadata.workspace_name.as_str()
            };
            NewWorkspace {
                name: format!("{base} (Imported)"),
                slug: format!("{}-import-{}", slugify(base), Utc::now().timestamp_millis()),
                owner_id: owner_id.to_string(),
            }
        });
        let destination = Destination {
            workspace_id,
            clinic_id: Uuid::new_v4().to_string(),
            clinic_name,
            created_workspace,
        };
        (destination, new_workspace)
    }

    async fn write(
        &self,
        ctx: &RemapContext<'_>,
        order: &[&TableDescriptor],
        bundle: &SnapshotBundle,
        tx: &mut ChunkedTx<'_>,
        result: &mut OperationResult,
        inserted: &mut Vec<(String, String, Vec<Value>)>,
    ) -> Result<(), ImportError> {
        let mut remap = IdRemap::default();
        for table in order {
            let mut inserter = RowInserter::new(table, Conflict::Fail);
            let mut dropped = BTreeSet::new();
            let mut nulled = BTreeMap::new();
            let (mut written, mut skipped) = (0u64, 0u64);
            let mut new_keys = Vec::new();

            for row in bundle.data.get(&table.name).into_iter().flatten() {
                let Some(obj) = row.as_object() else {
                    skipped += 1;
                    continue;
                };
                let (row, old_key, new_key) =
                    match remap_row(ctx, table, obj, &remap, &mut dropped, &mut nulled) {
                        Remapped::Skip(reason) => {
                            skipped += 1;
                            debug!(
                                target: LOG_TARGET,
                                event = "import_row_skipped",
                                table = %table.name,
                                reason = %reason
                            );
                            result.warn(format!("{}: row skipped: {reason}", table.name));
                            continue;
                        }
                        Remapped::Row {
                            row,
                            old_key,
                            new_key,
                        } => (row, old_key, new_key),
                    };

                let conn = tx.conn().await?;
                match inserter.insert(conn, &row).await {
                    Ok(_) => {
                        written += 1;
                        let key = if table.has_integer_pk() {
                            let rowid: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
                                .fetch_one(&mut *conn)
                                .await?;
                            Some(Value::from(rowid))
                        } else {
                            new_key.or_else(|| table.single_pk().and_then(|pk| row.get(pk).cloned()))
                        };
                        if let Some(key) = key {
                            if let Some(old) = &old_key {
                                remap.insert(&table.name, old, key.clone());
                            }
                            new_keys.push(key);
                        }
                    }
                    Err(err) => match classify_write_error(&err) {
                        WriteFailure::RowConstraint => {
                            skipped += 1;
                            debug!(
                                target: LOG_TARGET,
                                event = "import_row_skipped",
                                table = %table.name,
                                error = %err
                            );
                            result.warn(format!("{}: row skipped: {err}", table.name));
                        }
                        WriteFailure::ForeignKey | WriteFailure::Fatal => {
                            if let Err(commit_err) = tx.finish().await {
                                warn!(
                                    target: LOG_TARGET,
                                    event = "import_chunk_commit_failed",
                                    table = %table.name,
                                    error = %commit_err
                                );
                            }
                            record_inserted(inserted, table, new_keys);
                            result.add_written(&table.name, written);
                            result.add_skipped(&table.name, skipped);
                            return Err(ImportError::Write {
                                table: table.name.clone(),
                                source: err,
                            });
                        }
                    },
                }
                tx.row_done().await?;
            }

            report_table_notes(&table.name, &dropped, &nulled, result);
            info!(
                target: LOG_TARGET,
                event = "import_table",
                clinic_id = %ctx.clinic_id,
                table = %table.name,
                rows = written,
                skipped,
                rehearsal = tx.is_rehearsal()
            );
            record_inserted(inserted, table, new_keys);
            result.add_written(&table.name, written);
            result.add_skipped(&table.name, skipped);
        }
        Ok(())
    }

    /// Compensating deletes: inserted rows children first, then the clinic
    /// and, when this import created it, the workspace.
    async fn cleanup(&self, state: &ImportState, result: &mut OperationResult) {
        let Some(destination) = &state.destination else {
            return;
        };
        let outcome: Result<u64, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let mut removed = 0;
            for (table, pk, keys) in state.inserted.iter().rev() {
                removed += delete_where_in(&mut tx, table, pk, keys, self.lookup_chunk_size).await?;
            }
            sqlx::query("DELETE FROM clinics WHERE id = ?1")
                .bind(&destination.clinic_id)
                .execute(&mut *tx)
                .await?;
            if destination.created_workspace {
                sqlx::query("DELETE FROM workspaces WHERE id = ?1")
                    .bind(&destination.workspace_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(removed)
        }
        .await;

        match outcome {
            Ok(removed) => {
                info!(
                    target: LOG_TARGET,
                    event = "import_cleanup",
                    clinic_id = %destination.clinic_id,
                    rows = removed
                );
                result.warn(format!(
                    "import rolled back: {removed} rows and the new clinic removed"
                ));
                result.workspace_id = None;
                result.clinic_ids = None;
            }
            Err(err) => {
                warn!(target: LOG_TARGET, event = "import_cleanup_failed", error = %err);
                result.error(None, format!("cleanup after failed import also failed: {err}"));
            }
        }
    }
}

fn record_inserted(
    inserted: &mut Vec<(String, String, Vec<Value>)>,
    table: &TableDescriptor,
    keys: Vec<Value>,
) {
    if keys.is_empty() {
        return;
    }
    if let Some(pk) = table.single_pk() {
        inserted.push((table.name.clone(), pk.to_string(), keys));
    }
}

fn report_table_notes(
    table: &str,
    dropped: &BTreeSet<String>,
    nulled: &BTreeMap<String, u64>,
    result: &mut OperationResult,
) {
    if !dropped.is_empty() {
        result.warn(format!(
            "{table}: dropped columns missing from the live schema: {}",
            dropped.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    for (column, count) in nulled {
        result.warn(format!(
            "{table}: {count} rows had {column} cleared because the referenced row was not imported"
        ));
    }
}

fn plan_order<'d>(
    discovery: &'d DiscoveryResult,
    bundle: &SnapshotBundle,
    options: &ImportOptions,
    result: &mut OperationResult,
) -> Vec<&'d TableDescriptor> {
    let filter = options.tables.as_deref();
    for (name, rows) in &bundle.data {
        if table_selected(filter, name) && discovery.get(name).is_none() {
            result.error(
                Some(name.as_str()),
                format!("table {name} is not in the live schema; {} rows skipped", rows.len()),
            );
            result.add_skipped(name, rows.len() as u64);
        }
    }
    discovery
        .full_order()
        .iter()
        .filter(|name| bundle.data.contains_key(*name) && table_selected(filter, name))
        .filter_map(|name| discovery.get(name))
        .collect()
}
