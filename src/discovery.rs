use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{codes, AppError};
use crate::LOG_TARGET;

pub const TENANT_COLUMN: &str = "clinic_id";
pub const WORKSPACE_COLUMN: &str = "workspace_id";

const EXCLUDED_TABLES: &[&str] = &["schema_migrations", "_backup", "_temp", "workspaces", "clinics"];

/// Child links the live schema does not declare as foreign keys.
/// `(table, column, parent_table, parent_key)`.
const KNOWN_INDIRECT: &[(&str, &str, &str, &str)] = &[
    ("chat_messages", "session_id", "chat_sessions", "id"),
    ("quote_items", "quote_id", "quotes", "id"),
    ("service_supplies", "service_id", "services", "id"),
    ("prescription_items", "prescription_id", "prescriptions", "id"),
];

/// A table reachable only through ids found in rows of an earlier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideTable {
    pub table: &'static str,
    pub column: &'static str,
    pub source_table: &'static str,
    pub source_column: &'static str,
}

pub const SIDE_TABLES: &[SideTable] = &[SideTable {
    table: "ai_feedback",
    column: "message_id",
    source_table: "chat_messages",
    source_column: "id",
}];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableCategory {
    Direct,
    Indirect,
    Hybrid,
}

impl TableCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            TableCategory::Direct => "direct",
            TableCategory::Indirect => "indirect",
            TableCategory::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRef {
    pub column: String,
    pub table: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub name: String,
    pub category: TableCategory,
    /// `clinic_id` for direct and hybrid tables, `parent_column -> parent.key` otherwise.
    pub tenant_column_or_join_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    pub depends_on: BTreeSet<String>,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub side_table: bool,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Single-column primary key, when the table has one.
    pub fn single_pk(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    /// Whether the primary key is an INTEGER rowid alias SQLite assigns itself.
    pub fn has_integer_pk(&self) -> bool {
        self.single_pk()
            .and_then(|pk| self.column(pk))
            .map(|c| c.decl_type.eq_ignore_ascii_case("INTEGER"))
            .unwrap_or(false)
    }

    pub fn is_tenant_scoped(&self) -> bool {
        matches!(self.category, TableCategory::Direct | TableCategory::Hybrid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub total: usize,
    pub direct: usize,
    pub indirect: usize,
    pub hybrid: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub tables: Vec<TableDescriptor>,
    pub foreign_key_order: Vec<String>,
    pub discovered_at: String,
    /// Soft-linked tables exported in a second pass; not part of `tables`.
    #[serde(default)]
    pub side_tables: Vec<TableDescriptor>,
}

impl DiscoveryResult {
    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .chain(self.side_tables.iter())
            .find(|t| t.name == name)
    }

    pub fn summary(&self) -> DiscoverySummary {
        let mut summary = DiscoverySummary {
            total: self.tables.len(),
            ..DiscoverySummary::default()
        };
        for table in &self.tables {
            match table.category {
                TableCategory::Direct => summary.direct += 1,
                TableCategory::Indirect => summary.indirect += 1,
                TableCategory::Hybrid => summary.hybrid += 1,
            }
        }
        summary
    }

    /// FK order with every side table slotted in right after its source.
    pub fn full_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.foreign_key_order.len() + self.side_tables.len());
        for name in &self.foreign_key_order {
            order.push(name.clone());
            for side in self
                .side_tables
                .iter()
                .filter(|s| s.parent_table.as_deref() == Some(name.as_str()))
            {
                order.push(side.name.clone());
            }
        }
        order
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("foreign key cycle among tenant tables: {}", tables.join(", "))]
    Cycle { tables: Vec<String> },
    #[error("unsafe identifier in live schema: {0}")]
    InvalidIdentifier(String),
    #[error("database error during discovery: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DiscoveryError> for AppError {
    fn from(err: DiscoveryError) -> Self {
        let mut app = AppError::new(codes::DISCOVERY_FAILED, err.to_string());
        if let DiscoveryError::Cycle { tables } = &err {
            app = app.with_context("tables", tables.join(","));
        }
        app
    }
}

pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_TABLES.contains(&name) || name.starts_with("sqlite_") || name.starts_with('_')
}

/// Kahn's algorithm over `table -> dependencies`. The ready queue is ordered
/// so equal schemas always give the same order. Self-references are ignored;
/// dependencies outside the map are treated as already satisfied.
pub fn topological_order(
    graph: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, DiscoveryError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (table, deps) in graph {
        let entry = in_degree.entry(table.as_str()).or_insert(0);
        for dep in deps {
            if dep == table || !graph.contains_key(dep) {
                continue;
            }
            *entry += 1;
            dependents.entry(dep.as_str()).or_default().push(table.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(t, _)| *t)
        .collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for child in children {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if order.len() != graph.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let tables = graph
            .keys()
            .filter(|t| !placed.contains(t.as_str()))
            .cloned()
            .collect();
        return Err(DiscoveryError::Cycle { tables });
    }
    Ok(order)
}

struct RawTable {
    columns: Vec<ColumnInfo>,
    foreign_keys: Vec<ForeignKeyRef>,
}

async fn load_table(pool: &SqlitePool, table: &str) -> Result<RawTable, DiscoveryError> {
    let rows = sqlx::query(r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1) ORDER BY cid"#)
        .bind(table)
        .fetch_all(pool)
        .await?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        if !is_safe_identifier(&name) {
            return Err(DiscoveryError::InvalidIdentifier(format!("{table}.{name}")));
        }
        columns.push(ColumnInfo {
            name,
            decl_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
            not_null: row.try_get::<i64, _>("notnull")? != 0,
            pk: row.try_get("pk")?,
        });
    }

    let fk_rows = sqlx::query(
        r#"SELECT "from", "table", "to" FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
    )
    .bind(table)
    .fetch_all(pool)
    .await?;
    let mut foreign_keys = Vec::with_capacity(fk_rows.len());
    for row in fk_rows {
        let column: String = row.try_get("from")?;
        let parent: String = row.try_get("table")?;
        let to: Option<String> = row.try_get("to")?;
        foreign_keys.push(ForeignKeyRef {
            column,
            table: parent,
            to: to.unwrap_or_else(|| "id".to_string()),
        });
    }

    Ok(RawTable {
        columns,
        foreign_keys,
    })
}

/// Classify every table in the live schema and order the tenant ones.
pub async fn discover_tables(pool: &SqlitePool) -> Result<DiscoveryResult, DiscoveryError> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(pool)
            .await?;

    let mut raw: BTreeMap<String, RawTable> = BTreeMap::new();
    for name in names.into_iter().filter(|n| !is_excluded(n)) {
        if !is_safe_identifier(&name) {
            return Err(DiscoveryError::InvalidIdentifier(name));
        }
        let table = load_table(pool, &name).await?;
        raw.insert(name, table);
    }

    let mut categories: BTreeMap<String, TableCategory> = BTreeMap::new();
    for (name, table) in &raw {
        if let Some(col) = table.columns.iter().find(|c| c.name == TENANT_COLUMN) {
            let category = if col.not_null {
                TableCategory::Direct
            } else {
                TableCategory::Hybrid
            };
            categories.insert(name.clone(), category);
        }
    }

    // (parent_table, parent_column, parent_key) per indirect table.
    let mut links: BTreeMap<String, (String, String, String)> = BTreeMap::new();
    loop {
        let mut changed = false;
        for (name, table) in &raw {
            if categories.contains_key(name) {
                continue;
            }
            let mut candidates: Vec<(bool, &str, &str, &str)> = table
                .foreign_keys
                .iter()
                .filter(|fk| fk.table != *name)
                .filter_map(|fk| {
                    categories.get(&fk.table).map(|cat| {
                        (
                            *cat != TableCategory::Direct,
                            fk.table.as_str(),
                            fk.column.as_str(),
                            fk.to.as_str(),
                        )
                    })
                })
                .collect();
            if candidates.is_empty() {
                candidates = KNOWN_INDIRECT
                    .iter()
                    .filter(|(t, col, parent, _)| {
                        *t == name.as_str()
                            && table.columns.iter().any(|c| c.name == *col)
                            && categories.contains_key(*parent)
                    })
                    .map(|(_, col, parent, key)| {
                        let is_direct = categories.get(*parent) == Some(&TableCategory::Direct);
                        (!is_direct, *parent, *col, *key)
                    })
                    .collect();
            }
            candidates.sort();
            if let Some((_, parent, column, key)) = candidates.first() {
                links.insert(
                    name.clone(),
                    (parent.to_string(), column.to_string(), key.to_string()),
                );
                categories.insert(name.clone(), TableCategory::Indirect);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for name in categories.keys() {
        let Some(table) = raw.get(name) else { continue };
        let mut deps: BTreeSet<String> = table
            .foreign_keys
            .iter()
            .filter(|fk| fk.table != *name && categories.contains_key(&fk.table))
            .map(|fk| fk.table.clone())
            .collect();
        if let Some((parent, _, _)) = links.get(name) {
            deps.insert(parent.clone());
        }
        graph.insert(name.clone(), deps);
    }

    let foreign_key_order = topological_order(&graph)?;

    let mut tables = Vec::with_capacity(foreign_key_order.len());
    for name in &foreign_key_order {
        let (Some(table), Some(category)) = (raw.get(name), categories.get(name)) else {
            continue;
        };
        let link = links.get(name);
        tables.push(TableDescriptor {
            name: name.clone(),
            category: *category,
            tenant_column_or_join_path: match link {
                Some((parent, column, key)) => format!("{column} -> {parent}.{key}"),
                None => TENANT_COLUMN.to_string(),
            },
            parent_table: link.map(|l| l.0.clone()),
            parent_column: link.map(|l| l.1.clone()),
            parent_key: link.map(|l| l.2.clone()),
            depends_on: graph.get(name).cloned().unwrap_or_default(),
            columns: table.columns.clone(),
            primary_key: primary_key_of(&table.columns),
            foreign_keys: table.foreign_keys.clone(),
            side_table: false,
        });
    }

    let mut side_tables = Vec::new();
    for side in SIDE_TABLES {
        if categories.contains_key(side.table) || !categories.contains_key(side.source_table) {
            continue;
        }
        let Some(table) = raw.get(side.table) else {
            debug!(target: LOG_TARGET, event = "side_table_absent", table = side.table);
            continue;
        };
        if !table.columns.iter().any(|c| c.name == side.column) {
            warn!(
                target: LOG_TARGET,
                event = "side_table_column_missing",
                table = side.table,
                column = side.column
            );
            continue;
        }
        side_tables.push(TableDescriptor {
            name: side.table.to_string(),
            category: TableCategory::Indirect,
            tenant_column_or_join_path: format!(
                "{} -> {}.{}",
                side.column, side.source_table, side.source_column
            ),
            parent_table: Some(side.source_table.to_string()),
            parent_column: Some(side.column.to_string()),
            parent_key: Some(side.source_column.to_string()),
            depends_on: BTreeSet::from([side.source_table.to_string()]),
            columns: table.columns.clone(),
            primary_key: primary_key_of(&table.columns),
            foreign_keys: table.foreign_keys.clone(),
            side_table: true,
        });
    }

    Ok(DiscoveryResult {
        tables,
        foreign_key_order,
        discovered_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        side_tables,
    })
}

fn primary_key_of(columns: &[ColumnInfo]) -> Vec<String> {
    let mut pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk > 0).collect();
    pk.sort_by_key(|c| c.pk);
    pk.into_iter().map(|c| c.name.clone()).collect()
}

/// Discovery with a cached last result. Schema changes in a long-lived
/// process are picked up through `discover(true)` or `invalidate()`.
pub struct TableDiscoveryService {
    pool: SqlitePool,
    cached: RwLock<Option<Arc<DiscoveryResult>>>,
}

impl TableDiscoveryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cached: RwLock::new(None),
        }
    }

    pub async fn discover_clinic_tables(&self) -> Result<Arc<DiscoveryResult>, DiscoveryError> {
        self.discover(false).await
    }

    pub async fn discover(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<DiscoveryResult>, DiscoveryError> {
        if !force_refresh {
            if let Some(hit) = self.cached.read().await.clone() {
                return Ok(hit);
            }
        }

        let started = Instant::now();
        let result = match discover_tables(&self.pool).await {
            Ok(result) => Arc::new(result),
            Err(err) => {
                warn!(target: LOG_TARGET, event = "discovery_failed", error = %err);
                return Err(err);
            }
        };
        let summary = result.summary();
        info!(
            target: LOG_TARGET,
            event = "discovery_complete",
            total = summary.total,
            direct = summary.direct,
            indirect = summary.indirect,
            hybrid = summary.hybrid,
            side_tables = result.side_tables.len(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        *self.cached.write().await = Some(result.clone());
        Ok(result)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        debug!(target: LOG_TARGET, event = "discovery_cache_invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool_with(ddl: &[&str]) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in ddl {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        pool
    }

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(t, deps)| {
                (
                    t.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn kahn_orders_parents_first_and_ignores_self_edges() {
        let g = graph(&[
            ("treatments", &["patients", "services"]),
            ("patients", &["patients"]),
            ("services", &[]),
        ]);
        let order = topological_order(&g).unwrap();
        assert_eq!(order, vec!["patients", "services", "treatments"]);
    }

    #[test]
    fn kahn_reports_cycle_members() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let err = topological_order(&g).unwrap_err();
        match err {
            DiscoveryError::Cycle { tables } => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(is_safe_identifier("patients"));
        assert!(is_safe_identifier("_x1"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier("bad name"));
        assert!(!is_safe_identifier("quote\"d"));
        assert!(!is_safe_identifier(""));
    }

    #[tokio::test]
    async fn classifies_direct_hybrid_indirect_and_global() {
        let pool = pool_with(&[
            "CREATE TABLE clinics (id TEXT PRIMARY KEY)",
            "CREATE TABLE patients (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)",
            "CREATE TABLE categories (id TEXT PRIMARY KEY, clinic_id TEXT)",
            "CREATE TABLE visits (id TEXT PRIMARY KEY, patient_id TEXT NOT NULL REFERENCES patients(id))",
            "CREATE TABLE visit_notes (id TEXT PRIMARY KEY, visit_id TEXT REFERENCES visits(id))",
            "CREATE TABLE countries (id TEXT PRIMARY KEY, name TEXT)",
            "CREATE TABLE schema_migrations (version TEXT PRIMARY KEY)",
            "CREATE TABLE _scratch (id TEXT)",
        ])
        .await;

        let result = discover_tables(&pool).await.unwrap();
        let names: Vec<&str> = result.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains(&"countries"));
        assert!(!names.contains(&"clinics"));
        assert!(!names.contains(&"schema_migrations"));
        assert!(!names.contains(&"_scratch"));

        assert_eq!(result.get("patients").unwrap().category, TableCategory::Direct);
        assert_eq!(result.get("categories").unwrap().category, TableCategory::Hybrid);
        let notes = result.get("visit_notes").unwrap();
        assert_eq!(notes.category, TableCategory::Indirect);
        assert_eq!(notes.parent_table.as_deref(), Some("visits"));
        assert_eq!(notes.parent_column.as_deref(), Some("visit_id"));
        assert_eq!(notes.tenant_column_or_join_path, "visit_id -> visits.id");

        let pos = |n: &str| result.foreign_key_order.iter().position(|t| t == n).unwrap();
        assert!(pos("patients") < pos("visits"));
        assert!(pos("visits") < pos("visit_notes"));

        let summary = result.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.direct, 1);
        assert_eq!(summary.hybrid, 1);
        assert_eq!(summary.indirect, 2);
    }

    #[tokio::test]
    async fn prefers_direct_parent_for_indirect_links() {
        let pool = pool_with(&[
            "CREATE TABLE categories (id TEXT PRIMARY KEY, clinic_id TEXT)",
            "CREATE TABLE services (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)",
            "CREATE TABLE service_tags (id TEXT PRIMARY KEY, category_id TEXT REFERENCES categories(id), service_id TEXT REFERENCES services(id))",
        ])
        .await;
        let result = discover_tables(&pool).await.unwrap();
        let tags = result.get("service_tags").unwrap();
        assert_eq!(tags.parent_table.as_deref(), Some("services"));
        assert!(tags.depends_on.contains("categories"));
    }

    #[tokio::test]
    async fn known_links_cover_undeclared_foreign_keys() {
        let pool = pool_with(&[
            "CREATE TABLE quotes (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)",
            "CREATE TABLE quote_items (id TEXT PRIMARY KEY, quote_id TEXT NOT NULL)",
        ])
        .await;
        let result = discover_tables(&pool).await.unwrap();
        let items = result.get("quote_items").unwrap();
        assert_eq!(items.category, TableCategory::Indirect);
        assert_eq!(result.foreign_key_order, vec!["quotes", "quote_items"]);
    }

    #[tokio::test]
    async fn side_tables_follow_their_source() {
        let pool = pool_with(&[
            "CREATE TABLE chat_sessions (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)",
            "CREATE TABLE chat_messages (id TEXT PRIMARY KEY, session_id TEXT NOT NULL REFERENCES chat_sessions(id))",
            "CREATE TABLE ai_feedback (id TEXT PRIMARY KEY, message_id TEXT NOT NULL)",
            "CREATE TABLE zz_direct (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)",
        ])
        .await;
        let result = discover_tables(&pool).await.unwrap();
        assert!(result.tables.iter().all(|t| t.name != "ai_feedback"));
        let side = result.get("ai_feedback").unwrap();
        assert!(side.side_table);
        assert_eq!(side.parent_table.as_deref(), Some("chat_messages"));
        assert_eq!(
            result.full_order(),
            vec!["chat_sessions", "chat_messages", "ai_feedback", "zz_direct"]
        );
    }

    #[tokio::test]
    async fn cycle_is_fatal() {
        let pool = pool_with(&[
            "CREATE TABLE a (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL, b_id TEXT REFERENCES b(id))",
            "CREATE TABLE b (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL, a_id TEXT REFERENCES a(id))",
        ])
        .await;
        let err = discover_tables(&pool).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Cycle { .. }));
        assert_eq!(AppError::from(err).code(), codes::DISCOVERY_FAILED);
    }

    #[tokio::test]
    async fn service_caches_until_refresh() {
        let pool = pool_with(&["CREATE TABLE patients (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)"]).await;
        let service = TableDiscoveryService::new(pool.clone());
        let first = service.discover_clinic_tables().await.unwrap();
        sqlx::query("CREATE TABLE services (id TEXT PRIMARY KEY, clinic_id TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        let cached = service.discover_clinic_tables().await.unwrap();
        assert!(Arc::ptr_eq(&first, &cached));
        assert_eq!(cached.tables.len(), 1);

        let fresh = service.discover(true).await.unwrap();
        assert_eq!(fresh.tables.len(), 2);

        service.invalidate().await;
        let again = service.discover_clinic_tables().await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &again));
    }
}
