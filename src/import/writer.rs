//! Row writing shared by restore and import: insert statements cached per
//! column set, chunked transactions, and the key lookups both need before
//! they write.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::db::{bind_json, json_extract_for_column, placeholders, quote_ident};
use crate::discovery::{TableDescriptor, TENANT_COLUMN};
use crate::LOG_TARGET;

/// What an insert does when the primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conflict {
    /// Let the constraint fail.
    Fail,
    /// `DO NOTHING`; the row counts as skipped.
    Ignore,
    /// `DO UPDATE`, limited to rows of the same clinic on tenant tables.
    /// Rows of other tables must be checked for ownership before they get here.
    Update,
}

/// Stable text form of a key value, for sets and remap lookups.
pub(crate) fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keep only columns the live table has. Names of dropped columns are
/// collected into `dropped`.
pub(crate) fn project_row(
    row: &Map<String, Value>,
    table: &TableDescriptor,
    dropped: &mut BTreeSet<String>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in row {
        if table.has_column(key) {
            out.insert(key.clone(), value.clone());
        } else {
            dropped.insert(key.clone());
        }
    }
    out
}

pub(crate) struct RowInserter {
    table: String,
    primary_key: Vec<String>,
    tenant_scoped: bool,
    conflict: Conflict,
    statements: HashMap<Vec<String>, String>,
}

impl RowInserter {
    pub(crate) fn new(table: &TableDescriptor, conflict: Conflict) -> Self {
        Self {
            table: table.name.clone(),
            primary_key: table.primary_key.clone(),
            tenant_scoped: table.is_tenant_scoped() && table.has_column(TENANT_COLUMN),
            conflict,
            statements: HashMap::new(),
        }
    }

    fn build_sql(&self, columns: &[String]) -> String {
        let table = quote_ident(&self.table);
        if columns.is_empty() {
            return format!("INSERT INTO {table} DEFAULT VALUES");
        }
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = columns.iter().map(|c| json_extract_for_column(c)).collect();
        let mut sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            cols.join(", "),
            values.join(", ")
        );
        if self.primary_key.is_empty() {
            return sql;
        }
        let target: Vec<String> = self.primary_key.iter().map(|c| quote_ident(c)).collect();
        match self.conflict {
            Conflict::Fail => {}
            Conflict::Ignore => {
                sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", target.join(", ")));
            }
            Conflict::Update => {
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !self.primary_key.contains(c))
                    .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                    .collect();
                if updates.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", target.join(", ")));
                } else {
                    sql.push_str(&format!(
                        " ON CONFLICT({}) DO UPDATE SET {}",
                        target.join(", "),
                        updates.join(", ")
                    ));
                    if self.tenant_scoped {
                        sql.push_str(&format!(
                            " WHERE {table}.{0} IS excluded.{0}",
                            quote_ident(TENANT_COLUMN)
                        ));
                    }
                }
            }
        }
        sql
    }

    /// Insert one row, returning the number of rows changed (0 when the
    /// conflict clause swallowed it).
    pub(crate) async fn insert(
        &mut self,
        conn: &mut SqliteConnection,
        row: &Map<String, Value>,
    ) -> Result<u64, sqlx::Error> {
        let columns: Vec<String> = row.keys().cloned().collect();
        if !self.statements.contains_key(&columns) {
            let sql = self.build_sql(&columns);
            self.statements.insert(columns.clone(), sql);
        }
        let sql = self
            .statements
            .get(&columns)
            .map(String::as_str)
            .unwrap_or_default();
        let mut query = sqlx::query(sql);
        if !columns.is_empty() {
            query = query.bind(Value::Object(row.clone()).to_string());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }
}

/// A write transaction committed every `chunk_size` rows.
///
/// A rehearsal runs the same statements in one transaction that is rolled
/// back at the end, so a dry run sees exactly the conflicts, constraint
/// failures and cascades a real run would.
pub(crate) struct ChunkedTx<'p> {
    pool: &'p SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    pending: usize,
    chunk_size: usize,
    rehearsal: bool,
}

impl<'p> ChunkedTx<'p> {
    pub(crate) fn new(pool: &'p SqlitePool, chunk_size: usize) -> Self {
        Self {
            pool,
            tx: None,
            pending: 0,
            chunk_size: chunk_size.max(1),
            rehearsal: false,
        }
    }

    pub(crate) fn rehearsal(pool: &'p SqlitePool) -> Self {
        Self {
            rehearsal: true,
            ..Self::new(pool, usize::MAX)
        }
    }

    pub(crate) fn is_rehearsal(&self) -> bool {
        self.rehearsal
    }

    pub(crate) async fn conn(&mut self) -> Result<&mut SqliteConnection, sqlx::Error> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        let tx = self.tx.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        Ok(&mut **tx)
    }

    pub(crate) async fn row_done(&mut self) -> Result<(), sqlx::Error> {
        self.pending += 1;
        if self.pending >= self.chunk_size {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Commit what is pending. A rehearsal keeps everything in its one
    /// transaction.
    pub(crate) async fn checkpoint(&mut self) -> Result<(), sqlx::Error> {
        if self.rehearsal {
            return Ok(());
        }
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!(target: LOG_TARGET, event = "db_chunk_commit", rows = self.pending);
        }
        self.pending = 0;
        Ok(())
    }

    /// Commit the last chunk, or roll the whole rehearsal back.
    pub(crate) async fn finish(&mut self) -> Result<(), sqlx::Error> {
        if !self.rehearsal {
            return self.checkpoint().await;
        }
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!(target: LOG_TARGET, event = "db_rehearsal_rollback", rows = self.pending);
        }
        self.pending = 0;
        Ok(())
    }
}

/// Which of `keys` already exist in `table.column`.
pub(crate) async fn existing_keys(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    keys: &[Value],
    chunk_size: usize,
) -> Result<HashSet<String>, sqlx::Error> {
    let mut found = HashSet::new();
    for chunk in keys.chunks(chunk_size.max(1)) {
        let sql = format!(
            "SELECT CAST({col} AS TEXT) FROM {table} WHERE {col} IN ({})",
            placeholders(chunk.len()),
            col = quote_ident(column),
            table = quote_ident(table),
        );
        let mut query = sqlx::query(&sql);
        for key in chunk {
            query = bind_json(query, key);
        }
        for row in query.fetch_all(pool).await? {
            if let Some(key) = row.try_get::<Option<String>, _>(0)? {
                found.insert(key);
            }
        }
    }
    Ok(found)
}

/// Primary keys of the shared (null-clinic) rows of a hybrid table.
pub(crate) async fn global_keys(
    pool: &SqlitePool,
    table: &TableDescriptor,
) -> Result<HashSet<String>, sqlx::Error> {
    let Some(pk) = table.single_pk() else {
        return Ok(HashSet::new());
    };
    let sql = format!(
        "SELECT CAST({pk} AS TEXT) FROM {table} WHERE {tenant} IS NULL",
        pk = quote_ident(pk),
        table = quote_ident(&table.name),
        tenant = quote_ident(TENANT_COLUMN),
    );
    let keys: Vec<Option<String>> = sqlx::query_scalar(&sql).fetch_all(pool).await?;
    Ok(keys.into_iter().flatten().collect())
}

/// Delete rows of `table` whose `column` is one of `values`, in chunks.
pub(crate) async fn delete_where_in(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    values: &[Value],
    chunk_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut deleted = 0;
    for chunk in values.chunks(chunk_size.max(1)) {
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(column),
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for value in chunk {
            query = bind_json(query, value);
        }
        deleted += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(deleted)
}
