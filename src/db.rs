use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, Pool, Row, Sqlite, Transaction, TypeInfo, ValueRef};
use tracing::{error, info, warn};

use crate::LOG_TARGET;

/// Open (creating if needed) the clinic database at `path`.
pub async fn open_pool(path: &Path) -> AnyResult<Pool<Sqlite>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            error!(
                target: LOG_TARGET,
                event = "db_dir_create_failed",
                error = %e,
                path = %parent.display()
            );
            e
        })?;
    }
    info!(target: LOG_TARGET, event = "db_path", path = %path.display());

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .with_context(|| format!("open sqlite database {}", path.display()))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: LOG_TARGET,
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if fks.0 != 1 {
        warn!(
            target: LOG_TARGET,
            event = "db_open_warning",
            msg = "foreign_keys pragma is off; restore ordering is not enforced"
        );
    }
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, E, F>(pool: &Pool<Sqlite>, f: F) -> Result<R, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(&'c mut Transaction<'static, Sqlite>) -> BoxFuture<'c, Result<R, E>>,
{
    let mut tx = pool.begin().await.map_err(E::from)?;
    info!(target: LOG_TARGET, event = "db_tx_begin");
    match f(&mut tx).await {
        Ok(val) => {
            tx.commit().await.map_err(E::from)?;
            info!(target: LOG_TARGET, event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: LOG_TARGET, event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target: LOG_TARGET, event = "db_tx_rollback");
            }
            Err(e)
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// `json_extract(?1, '$."col"')`, reading one column out of a bound row payload.
pub fn json_extract_for_column(column: &str) -> String {
    let escaped = column.replace('\\', "\\\\");
    let escaped = escaped.replace('"', "\\\"");
    let escaped = escaped.replace('\'', "''");
    format!("json_extract(?1, '$.\"{}\"')", escaped)
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Decode a row by the storage class of each value, so whatever type a column
/// declares, the JSON carries what SQLite actually stored. A BLOB must hold
/// UTF-8 text; anything else has no faithful JSON form and fails the read.
pub fn row_to_value(row: &SqliteRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let raw = row.try_get_raw(idx)?;
        let val = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => Value::from(row.try_get::<f64, _>(idx)?),
                "BLOB" => {
                    let bytes = row.try_get::<Vec<u8>, _>(idx)?;
                    let text = String::from_utf8(bytes).map_err(|e| sqlx::Error::ColumnDecode {
                        index: col.name().to_string(),
                        source: Box::new(e),
                    })?;
                    Value::from(text)
                }
                _ => Value::from(row.try_get::<String, _>(idx)?),
            }
        };
        map.insert(col.name().to_string(), val);
    }
    Ok(map)
}

/// Bind a JSON scalar with the SQLite type it maps to.
pub fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// How a failed write should be treated by the restore and import loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// UNIQUE, PRIMARY KEY, NOT NULL or CHECK: skip the row and carry on.
    RowConstraint,
    /// Referential integrity broke; remaining tables would cascade the damage.
    ForeignKey,
    /// Connection, I/O or anything else the row itself did not cause.
    Fatal,
}

pub fn classify_write_error(err: &sqlx::Error) -> WriteFailure {
    match err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation | ErrorKind::NotNullViolation | ErrorKind::CheckViolation => {
                WriteFailure::RowConstraint
            }
            ErrorKind::ForeignKeyViolation => WriteFailure::ForeignKey,
            _ => {
                // Extended codes sqlx does not map: 1555 is SQLITE_CONSTRAINT_PRIMARYKEY.
                match db.code().as_deref() {
                    Some("1555") | Some("2067") | Some("1299") | Some("275") => {
                        WriteFailure::RowConstraint
                    }
                    Some("787") => WriteFailure::ForeignKey,
                    _ => WriteFailure::Fatal,
                }
            }
        },
        _ => WriteFailure::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_exists(pool: &Pool<Sqlite>, table: &str) -> bool {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table)
                .fetch_optional(pool)
                .await
                .unwrap();
        found.is_some()
    }

    async fn memory_pool() -> Pool<Sqlite> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys=ON;")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE parent (id TEXT PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id TEXT NOT NULL REFERENCES parent(id), weight REAL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("patients"), "\"patients\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(json_extract_for_column("name"), "json_extract(?1, '$.\"name\"')");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[tokio::test]
    async fn row_values_follow_storage_class() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO parent (id, name) VALUES ('p1', 'a')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO child (parent_id, weight) VALUES ('p1', 2.5)")
            .execute(&pool)
            .await
            .unwrap();
        let row = sqlx::query("SELECT id, parent_id, weight, NULL AS \"nothing\" FROM child")
            .fetch_one(&pool)
            .await
            .unwrap();
        let map = row_to_value(&row).unwrap();
        assert_eq!(map["id"], Value::from(1));
        assert_eq!(map["parent_id"], Value::from("p1"));
        assert_eq!(map["weight"], Value::from(2.5));
        assert_eq!(map["nothing"], Value::Null);
    }

    #[tokio::test]
    async fn blobs_decode_as_text_or_fail() {
        let pool = memory_pool().await;
        let text = sqlx::query("SELECT CAST('scan.png' AS BLOB) AS label")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row_to_value(&text).unwrap()["label"], Value::from("scan.png"));

        let binary = sqlx::query("SELECT X'FF00FE' AS payload")
            .fetch_one(&pool)
            .await
            .unwrap();
        let err = row_to_value(&binary).unwrap_err();
        assert!(matches!(err, sqlx::Error::ColumnDecode { ref index, .. } if index == "payload"));
    }

    #[tokio::test]
    async fn write_errors_are_classified() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO parent (id, name) VALUES ('p1', 'a')")
            .execute(&pool)
            .await
            .unwrap();

        let dup = sqlx::query("INSERT INTO parent (id, name) VALUES ('p1', 'b')")
            .execute(&pool)
            .await
            .unwrap_err();
        assert_eq!(classify_write_error(&dup), WriteFailure::RowConstraint);

        let null = sqlx::query("INSERT INTO parent (id, name) VALUES ('p2', NULL)")
            .execute(&pool)
            .await
            .unwrap_err();
        assert_eq!(classify_write_error(&null), WriteFailure::RowConstraint);

        let orphan = sqlx::query("INSERT INTO child (parent_id) VALUES ('missing')")
            .execute(&pool)
            .await
            .unwrap_err();
        assert_eq!(classify_write_error(&orphan), WriteFailure::ForeignKey);

        assert_eq!(
            classify_write_error(&sqlx::Error::PoolTimedOut),
            WriteFailure::Fatal
        );
    }

    #[tokio::test]
    async fn run_in_tx_rolls_back_on_error() {
        let pool = memory_pool().await;
        let result: Result<(), sqlx::Error> = run_in_tx(&pool, |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO parent (id, name) VALUES ('p1', 'a')")
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("INSERT INTO parent (id, name) VALUES ('p1', 'a')")
                    .execute(&mut **tx)
                    .await?;
                Ok(())
            })
        })
        .await;
        assert!(result.is_err());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parent")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(table_exists(&pool, "parent").await);
        assert!(!table_exists(&pool, "ghost").await);
    }
}
