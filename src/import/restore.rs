use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::migrations::{MigrationError, Migrator};
use super::validator::{BundleValidator, ValidationError};
use super::writer::{existing_keys, global_keys, key_string, project_row, ChunkedTx, Conflict, RowInserter};
use super::{table_selected, OperationResult, RestoreMode, RestoreOptions};
use crate::config::SnapshotConfig;
use crate::db::{bind_json, classify_write_error, placeholders, quote_ident, row_to_value, WriteFailure};
use crate::discovery::{
    DiscoveryError, DiscoveryResult, TableCategory, TableDescriptor, TableDiscoveryService,
    TENANT_COLUMN,
};
use crate::error::{codes, AppError};
use crate::export::{ExportRequest, SnapshotExporter};
use crate::snapshot::{pack_bundle, read_bundle_value, CodecError, CreatedBy, SnapshotBundle, SnapshotType};
use crate::storage::SnapshotStorageService;
use crate::LOG_TARGET;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("bundle could not be read: {0}")]
    Unreadable(#[from] CodecError),
    #[error("bundle does not parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("CLINIC_MISMATCH: bundle belongs to clinic {bundle}, not {target}")]
    ClinicMismatch { bundle: String, target: String },
    #[error(
        "replacing the selected tables would also clear rows of {}; add them to the table list or restore without one",
        tables.join(", ")
    )]
    DependentsOutsideScope { tables: Vec<String> },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("pre-restore backup failed: {0}")]
    Backup(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to clear table {table}: {source}")]
    Delete {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("write to {table} failed: {source}")]
    Write {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RestoreError {
    fn table(&self) -> Option<&str> {
        match self {
            RestoreError::Delete { table, .. } | RestoreError::Write { table, .. } => {
                Some(table.as_str())
            }
            _ => None,
        }
    }
}

impl From<RestoreError> for AppError {
    fn from(err: RestoreError) -> Self {
        match err {
            RestoreError::Validation(inner) => inner.into(),
            RestoreError::Migration(inner) => inner.into(),
            RestoreError::Discovery(inner) => inner.into(),
            RestoreError::Unreadable(CodecError::TooLarge { size, limit }) => AppError::new(
                codes::QUOTA_EXCEEDED,
                format!("bundle is {size} bytes, over the {limit} byte ceiling"),
            ),
            RestoreError::Unreadable(_) | RestoreError::Parse(_) => {
                AppError::new(codes::INVALID_SNAPSHOT, err.to_string())
            }
            RestoreError::ClinicMismatch { bundle, target } => AppError::new(
                codes::RESTORE_FAILED,
                format!("bundle belongs to clinic {bundle}, not {target}"),
            )
            .with_context("reason", "CLINIC_MISMATCH"),
            RestoreError::DependentsOutsideScope { tables } => AppError::new(
                codes::RESTORE_FAILED,
                format!(
                    "replacing the selected tables would also clear rows of {}",
                    tables.join(", ")
                ),
            )
            .with_context("reason", "DEPENDENTS_OUTSIDE_SCOPE")
            .with_context("tables", tables.join(",")),
            other => {
                let app = AppError::new(codes::RESTORE_FAILED, other.to_string());
                match other.table() {
                    Some(table) => app.with_context("table", table),
                    None => app,
                }
            }
        }
    }
}

/// Live key values per `(table, column)` inside one clinic's scope.
type ScopeKeys = HashMap<(String, String), Vec<Value>>;

struct PreparedTable<'d> {
    table: &'d TableDescriptor,
    rows: Vec<Map<String, Value>>,
    skipped: u64,
}

/// Loads a bundle back into the clinic it was exported from.
pub struct SnapshotRestorer {
    pool: SqlitePool,
    discovery: Arc<TableDiscoveryService>,
    exporter: Arc<SnapshotExporter>,
    storage: SnapshotStorageService,
    validator: BundleValidator,
    migrator: Migrator,
    insert_chunk_size: usize,
    lookup_chunk_size: usize,
    max_bundle_bytes: u64,
}

impl SnapshotRestorer {
    pub fn new(
        pool: SqlitePool,
        discovery: Arc<TableDiscoveryService>,
        exporter: Arc<SnapshotExporter>,
        storage: SnapshotStorageService,
        config: &SnapshotConfig,
    ) -> Self {
        Self {
            pool,
            discovery,
            exporter,
            storage,
            validator: BundleValidator::new(),
            migrator: Migrator::new(),
            insert_chunk_size: config.insert_chunk_size.max(1),
            lookup_chunk_size: config.lookup_chunk_size.max(1),
            max_bundle_bytes: config.max_bundle_bytes,
        }
    }

    /// Restore packed (or plain JSON) bundle bytes into `clinic_id`. Never
    /// fails outright: problems land in the result's `errors`.
    pub async fn restore(
        &self,
        bytes: &[u8],
        clinic_id: &str,
        created_by: &CreatedBy,
        options: &RestoreOptions,
    ) -> OperationResult {
        let started = Instant::now();
        info!(
            target: LOG_TARGET,
            event = "restore_started",
            clinic_id = %clinic_id,
            mode = ?options.mode,
            dry_run = options.dry_run,
            bytes = bytes.len()
        );
        let mut result = OperationResult::started(options.dry_run);
        if let Err(err) = self
            .run(bytes, clinic_id, created_by, options, &mut result)
            .await
        {
            warn!(
                target: LOG_TARGET,
                event = "restore_failed",
                clinic_id = %clinic_id,
                error = %err
            );
            result.fatal(err.table(), err.to_string());
        }
        let result = result.finish(started);
        info!(
            target: LOG_TARGET,
            event = "restore_complete",
            clinic_id = %clinic_id,
            success = result.success,
            restored = result.total_written(),
            skipped = result.total_skipped(),
            elapsed_ms = result.duration_ms
        );
        result
    }

    async fn run(
        &self,
        bytes: &[u8],
        clinic_id: &str,
        created_by: &CreatedBy,
        options: &RestoreOptions,
        result: &mut OperationResult,
    ) -> Result<(), RestoreError> {
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

        if bundle.metadata.clinic_id != clinic_id {
            return Err(RestoreError::ClinicMismatch {
                bundle: bundle.metadata.clinic_id.clone(),
                target: clinic_id.to_string(),
            });
        }

        let (bundle, migration) = self.migrator.apply_migrations(&bundle)?;
        if !migration.applied.is_empty() {
            result.warn(format!(
                "bundle migrated from schema version {} to {}",
                migration.from_version, migration.to_version
            ));
        }
        result.warnings.extend(migration.warnings);

        let discovery = self.discovery.discover_clinic_tables().await?;
        let order = plan_order(&discovery, &bundle, options, result);
        let replacing = options.mode == RestoreMode::Replace;
        if replacing {
            let outside = dependents_outside(&discovery, &order);
            if !outside.is_empty() {
                return Err(RestoreError::DependentsOutsideScope { tables: outside });
            }
        }

        if options.create_backup_first && !options.dry_run {
            let backup_id = self.backup(clinic_id, created_by).await?;
            result.pre_restore_snapshot_id = Some(backup_id);
        }

        // Every read happens before the write transaction opens.
        let scopes = self.scope_keys(&discovery, clinic_id).await?;
        let prepared = self
            .prepare(&order, &bundle, clinic_id, &scopes, replacing, result)
            .await?;

        let conflict = match options.mode {
            RestoreMode::Replace => Conflict::Fail,
            RestoreMode::Merge if options.overwrite => Conflict::Update,
            RestoreMode::Merge => Conflict::Ignore,
        };
        let mut tx = if options.dry_run {
            ChunkedTx::rehearsal(&self.pool)
        } else {
            ChunkedTx::new(&self.pool, self.insert_chunk_size)
        };
        if replacing {
            self.clear_scope(&mut tx, &order, clinic_id, &scopes, result)
                .await?;
        }
        self.write_tables(&mut tx, prepared, clinic_id, conflict, result)
            .await?;
        tx.finish().await?;
        Ok(())
    }

    async fn backup(&self, clinic_id: &str, created_by: &CreatedBy) -> Result<String, RestoreError> {
        let request = ExportRequest {
            clinic_id: clinic_id.to_string(),
            snapshot_type: SnapshotType::PreRestore,
            created_by: created_by.clone(),
        };
        let bundle = self
            .exporter
            .export(&request)
            .await
            .map_err(|e| RestoreError::Backup(e.to_string()))?;
        let packed = pack_bundle(&bundle, self.max_bundle_bytes)
            .map_err(|e| RestoreError::Backup(e.to_string()))?;
        let (metadata, bytes) = (bundle.metadata, packed.bytes);
        let saved = self
            .storage
            .blocking(move |s| s.save_snapshot(&metadata, &bytes))
            .await
            .map_err(|e| RestoreError::Backup(e.to_string()))?;
        info!(
            target: LOG_TARGET,
            event = "pre_restore_backup",
            clinic_id = %clinic_id,
            snapshot_id = %saved.snapshot_id,
            records = saved.total_records()
        );
        Ok(saved.snapshot_id)
    }

    /// `WHERE` fragments selecting one clinic's rows of `table`, chunked for
    /// indirect tables.
    fn scope_filters(
        &self,
        table: &TableDescriptor,
        clinic_id: &str,
        scopes: &ScopeKeys,
    ) -> Vec<(String, Vec<Value>)> {
        if table.is_tenant_scoped() {
            return vec![(
                format!("{} = ?", quote_ident(TENANT_COLUMN)),
                vec![Value::from(clinic_id)],
            )];
        }
        let (Some(parent), Some(column), Some(key)) = (
            table.parent_table.as_deref(),
            table.parent_column.as_deref(),
            table.parent_key.as_deref(),
        ) else {
            return Vec::new();
        };
        let Some(values) = scopes.get(&(parent.to_string(), key.to_string())) else {
            return Vec::new();
        };
        values
            .chunks(self.lookup_chunk_size)
            .map(|chunk| {
                (
                    format!("{} IN ({})", quote_ident(column), placeholders(chunk.len())),
                    chunk.to_vec(),
                )
            })
            .collect()
    }

    /// Walk the FK order collecting the live key values children are
    /// scoped by.
    async fn scope_keys(
        &self,
        discovery: &DiscoveryResult,
        clinic_id: &str,
    ) -> Result<ScopeKeys, RestoreError> {
        let mut needed: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for table in discovery.tables.iter().chain(discovery.side_tables.iter()) {
            if let (Some(parent), Some(key)) = (table.parent_table.as_deref(), table.parent_key.as_deref()) {
                needed.entry(parent).or_default().insert(key);
            }
        }

        let mut scopes = ScopeKeys::new();
        for name in discovery.full_order() {
            let (Some(table), Some(keys)) = (discovery.get(&name), needed.get(name.as_str())) else {
                continue;
            };
            for key in keys {
                let mut values = Vec::new();
                let mut seen = HashSet::new();
                for (filter, binds) in self.scope_filters(table, clinic_id, &scopes) {
                    let sql = format!(
                        "SELECT DISTINCT {} AS k FROM {} WHERE {}",
                        quote_ident(key),
                        quote_ident(&table.name),
                        filter
                    );
                    let mut query = sqlx::query(&sql);
                    for bind in &binds {
                        query = bind_json(query, bind);
                    }
                    for row in query.fetch_all(&self.pool).await? {
                        let value = row_to_value(&row)?.remove("k").unwrap_or(Value::Null);
                        if !value.is_null() && seen.insert(key_string(&value)) {
                            values.push(value);
                        }
                    }
                }
                scopes.insert((name.clone(), key.to_string()), values);
            }
        }
        Ok(scopes)
    }

    /// Replace mode: remove the clinic's current rows, children first. The
    /// deletes are committed together before any row is written.
    async fn clear_scope(
        &self,
        tx: &mut ChunkedTx<'_>,
        order: &[&TableDescriptor],
        clinic_id: &str,
        scopes: &ScopeKeys,
        result: &mut OperationResult,
    ) -> Result<(), RestoreError> {
        for table in order.iter().rev() {
            let mut deleted = 0u64;
            for (filter, binds) in self.scope_filters(table, clinic_id, scopes) {
                let sql = format!("DELETE FROM {} WHERE {}", quote_ident(&table.name), filter);
                let mut query = sqlx::query(&sql);
                for bind in &binds {
                    query = bind_json(query, bind);
                }
                deleted += query
                    .execute(tx.conn().await?)
                    .await
                    .map_err(|source| RestoreError::Delete {
                        table: table.name.clone(),
                        source,
                    })?
                    .rows_affected();
            }
            debug!(
                target: LOG_TARGET,
                event = "restore_table_cleared",
                clinic_id = %clinic_id,
                table = %table.name,
                rows = deleted
            );
            result.deleted_records.insert(table.name.clone(), deleted);
        }
        tx.checkpoint().await?;
        Ok(())
    }

    /// Primary keys of `table` rows the clinic owns right now.
    async fn owned_keys(
        &self,
        table: &TableDescriptor,
        pk: &str,
        clinic_id: &str,
        scopes: &ScopeKeys,
    ) -> Result<HashSet<String>, sqlx::Error> {
        let mut owned = HashSet::new();
        for (filter, binds) in self.scope_filters(table, clinic_id, scopes) {
            let sql = format!(
                "SELECT CAST({} AS TEXT) FROM {} WHERE {}",
                quote_ident(pk),
                quote_ident(&table.name),
                filter
            );
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = bind_json(query, bind);
            }
            for row in query.fetch_all(&self.pool).await? {
                if let Some(key) = row.try_get::<Option<String>, _>(0)? {
                    owned.insert(key);
                }
            }
        }
        Ok(owned)
    }

    /// Filter each table's bundle rows down to what may be written into this
    /// clinic. Rows whose key another clinic already holds, and child rows
    /// whose parent lies outside the clinic, are skipped here so neither the
    /// insert nor an overwrite can reach them.
    async fn prepare<'d>(
        &self,
        order: &[&'d TableDescriptor],
        bundle: &SnapshotBundle,
        clinic_id: &str,
        scopes: &ScopeKeys,
        replacing: bool,
        result: &mut OperationResult,
    ) -> Result<Vec<PreparedTable<'d>>, RestoreError> {
        // Parent keys child rows may point at, per `(table, column)`. In
        // replace mode a cleared table only keeps what the bundle brings back.
        let mut parents: HashMap<(String, String), HashSet<String>> = scopes
            .iter()
            .map(|(k, values)| (k.clone(), values.iter().map(key_string).collect()))
            .collect();

        let mut prepared = Vec::with_capacity(order.len());
        for &table in order {
            let globals = if table.category == TableCategory::Hybrid {
                global_keys(&self.pool, table).await?
            } else {
                HashSet::new()
            };
            let rows = bundle
                .data
                .get(&table.name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let link = match (
                table.is_tenant_scoped(),
                table.parent_table.as_deref(),
                table.parent_column.as_deref(),
                table.parent_key.as_deref(),
            ) {
                (false, Some(parent), Some(column), Some(key)) => Some(ParentLink {
                    column,
                    allowed: parents
                        .get(&(parent.to_string(), key.to_string()))
                        .cloned()
                        .unwrap_or_default(),
                }),
                _ => None,
            };
            let mut plan = prepare_rows(table, rows, clinic_id, &globals, link.as_ref(), result);

            if let Some(pk) = table.single_pk() {
                let keys: Vec<Value> = plan
                    .rows
                    .iter()
                    .filter_map(|r| r.get(pk))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect();
                let existing =
                    existing_keys(&self.pool, &table.name, pk, &keys, self.lookup_chunk_size).await?;
                if !existing.is_empty() {
                    let owned = self.owned_keys(table, pk, clinic_id, scopes).await?;
                    let before = plan.rows.len();
                    plan.rows.retain(|row| {
                        row.get(pk)
                            .map(key_string)
                            .map(|k| !existing.contains(&k) || owned.contains(&k))
                            .unwrap_or(true)
                    });
                    let taken = (before - plan.rows.len()) as u64;
                    if taken > 0 {
                        plan.skipped += taken;
                        result.warn(format!(
                            "{}: {taken} rows use keys another clinic holds and were skipped",
                            table.name
                        ));
                    }
                }
            }

            for ((parent, key), allowed) in parents.iter_mut() {
                if *parent != table.name {
                    continue;
                }
                if replacing {
                    allowed.clear();
                }
                allowed.extend(
                    plan.rows
                        .iter()
                        .filter_map(|r| r.get(key.as_str()))
                        .filter(|v| !v.is_null())
                        .map(key_string),
                );
            }
            prepared.push(plan);
        }
        Ok(prepared)
    }

    async fn write_tables(
        &self,
        tx: &mut ChunkedTx<'_>,
        prepared: Vec<PreparedTable<'_>>,
        clinic_id: &str,
        conflict: Conflict,
        result: &mut OperationResult,
    ) -> Result<(), RestoreError> {
        for plan in prepared {
            let table = plan.table;
            let mut inserter = RowInserter::new(table, conflict);
            let mut written = 0u64;
            let mut skipped = plan.skipped;
            for row in &plan.rows {
                let conn = tx.conn().await?;
                match inserter.insert(conn, row).await {
                    Ok(0) => skipped += 1,
                    Ok(_) => written += 1,
                    Err(err) => match classify_write_error(&err) {
                        WriteFailure::RowConstraint => {
                            skipped += 1;
                            debug!(
                                target: LOG_TARGET,
                                event = "restore_row_skipped",
                                table = %table.name,
                                error = %err
                            );
                            result.warn(format!(
                                "{}: row {} skipped: {err}",
                                table.name,
                                row_label(table, row)
                            ));
                        }
                        WriteFailure::ForeignKey | WriteFailure::Fatal => {
                            if let Err(commit_err) = tx.finish().await {
                                warn!(
                                    target: LOG_TARGET,
                                    event = "restore_chunk_commit_failed",
                                    table = %table.name,
                                    error = %commit_err
                                );
                            }
                            result.add_written(&table.name, written);
                            result.add_skipped(&table.name, skipped);
                            return Err(RestoreError::Write {
                                table: table.name.clone(),
                                source: err,
                            });
                        }
                    },
                }
                tx.row_done().await?;
            }
            info!(
                target: LOG_TARGET,
                event = "restore_table",
                clinic_id = %clinic_id,
                table = %table.name,
                rows = written,
                skipped,
                rehearsal = tx.is_rehearsal()
            );
            result.add_written(&table.name, written);
            result.add_skipped(&table.name, skipped);
        }
        Ok(())
    }
}

/// Live tables outside `order` that point into a table `order` clears.
/// Clearing under them would cascade into, or be blocked by, rows the
/// caller asked to leave alone.
fn dependents_outside(discovery: &DiscoveryResult, order: &[&TableDescriptor]) -> Vec<String> {
    let cleared: HashSet<&str> = order.iter().map(|t| t.name.as_str()).collect();
    discovery
        .tables
        .iter()
        .chain(discovery.side_tables.iter())
        .filter(|t| !cleared.contains(t.name.as_str()))
        .filter(|t| t.depends_on.iter().any(|d| cleared.contains(d.as_str())))
        .map(|t| t.name.clone())
        .collect()
}

/// Tables to write, in insert order: live discovery order restricted to what
/// the bundle carries and the caller asked for. Bundle tables the live schema
/// lacks are reported and counted as skipped.
fn plan_order<'d>(
    discovery: &'d DiscoveryResult,
    bundle: &SnapshotBundle,
    options: &RestoreOptions,
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

/// The parent column of an indirect table and the parent keys inside the
/// clinic.
struct ParentLink<'a> {
    column: &'a str,
    allowed: HashSet<String>,
}

/// Rows that may be written: objects belonging to the target clinic (or, for
/// indirect tables, hanging off a parent inside it), never shared rows of
/// hybrid tables, with columns the live table lacks dropped and duplicate
/// keys removed.
fn prepare_rows<'d>(
    table: &'d TableDescriptor,
    rows: &[Value],
    clinic_id: &str,
    globals: &HashSet<String>,
    link: Option<&ParentLink<'_>>,
    result: &mut OperationResult,
) -> PreparedTable<'d> {
    let tenant = table.is_tenant_scoped() && table.has_column(TENANT_COLUMN);
    let pk = table.single_pk();
    let mut dropped = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    let (mut foreign, mut shared, mut duplicate, mut malformed) = (0u64, 0u64, 0u64, 0u64);
    let mut orphaned = 0u64;

    for row in rows {
        let Some(obj) = row.as_object() else {
            malformed += 1;
            continue;
        };
        if tenant {
            match obj.get(TENANT_COLUMN) {
                Some(Value::String(owner)) if owner == clinic_id => {}
                None | Some(Value::Null) if table.category == TableCategory::Hybrid => {
                    shared += 1;
                    continue;
                }
                _ => {
                    foreign += 1;
                    continue;
                }
            }
        }
        if let Some(link) = link {
            let inside = obj
                .get(link.column)
                .filter(|v| !v.is_null())
                .map(|v| link.allowed.contains(&key_string(v)))
                .unwrap_or(false);
            if !inside {
                orphaned += 1;
                continue;
            }
        }
        if let Some(key) = pk.and_then(|pk| obj.get(pk)).filter(|v| !v.is_null()) {
            let key = key_string(key);
            if globals.contains(&key) {
                shared += 1;
                continue;
            }
            if !seen.insert(key) {
                duplicate += 1;
                continue;
            }
        }
        out.push(project_row(obj, table, &mut dropped));
    }

    let name = &table.name;
    if !dropped.is_empty() {
        result.warn(format!(
            "{name}: dropped columns missing from the live schema: {}",
            dropped.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    if foreign > 0 {
        result.warn(format!("{name}: {foreign} rows belong to another clinic and were skipped"));
    }
    if orphaned > 0 {
        result.warn(format!(
            "{name}: {orphaned} rows hang off parents outside this clinic and were skipped"
        ));
    }
    if shared > 0 {
        result.warn(format!("{name}: {shared} shared rows left untouched"));
    }
    if duplicate > 0 {
        result.warn(format!("{name}: {duplicate} rows repeat a primary key and were skipped"));
    }
    if malformed > 0 {
        result.warn(format!("{name}: {malformed} rows are not objects and were skipped"));
    }

    PreparedTable {
        table,
        rows: out,
        skipped: foreign + shared + duplicate + malformed + orphaned,
    }
}

fn row_label(table: &TableDescriptor, row: &Map<String, Value>) -> String {
    table
        .single_pk()
        .and_then(|pk| row.get(pk))
        .map(key_string)
        .unwrap_or_else(|| "?".to_string())
}
