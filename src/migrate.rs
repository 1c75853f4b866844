//! Live clinic schema used by the CLI and by tests. Bundles are migrated
//! separately (`import::migrations`); this module only shapes the database.

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, SqlitePool};
use tracing::{error, info};

use crate::LOG_TARGET;

struct LiveMigration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const LIVE_MIGRATIONS: &[LiveMigration] = &[
    LiveMigration {
        version: 1,
        name: "clinic_core",
        sql: include_str!("../migrations/0001_clinic_core.sql"),
    },
    LiveMigration {
        version: 2,
        name: "quotes",
        sql: include_str!("../migrations/0002_quotes.sql"),
    },
    LiveMigration {
        version: 3,
        name: "chat",
        sql: include_str!("../migrations/0003_chat.sql"),
    },
    LiveMigration {
        version: 4,
        name: "treatment_status",
        sql: include_str!("../migrations/0004_treatment_status.sql"),
    },
];

// SQLite has no `ADD COLUMN IF NOT EXISTS`.
static ADD_COLUMN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").ok());

/// Outcome of [`apply_migrations`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationRun {
    pub applied: Vec<&'static str>,
    pub already_applied: usize,
}

/// Latest schema version shipped with this build.
pub fn latest_version() -> i64 {
    LIVE_MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn without_comments(sql: &str) -> String {
    sql.lines()
        .map(str::trim_end)
        .filter(|line| {
            let line = line.trim_start();
            !line.is_empty() && !line.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}

fn short(sql: &str) -> String {
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(120) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

/// Applies every pending migration, each inside its own transaction.
///
/// Applied migrations are recorded with a SHA-256 of their comment-free SQL;
/// a migration whose text changed after it ran is refused rather than re-run.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<MigrationRun> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            checksum   TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .await
    .context("create schema_migrations")?;

    let recorded: Vec<(i64, String)> =
        sqlx::query_as("SELECT version, checksum FROM schema_migrations")
            .fetch_all(pool)
            .await?;

    let mut run = MigrationRun::default();
    for migration in LIVE_MIGRATIONS {
        let sql = without_comments(migration.sql);
        let checksum = format!("{:x}", Sha256::digest(sql.as_bytes()));

        if let Some((_, stored)) = recorded.iter().find(|(v, _)| *v == migration.version) {
            if *stored != checksum {
                anyhow::bail!(
                    "migration {:04}_{} edited after application",
                    migration.version,
                    migration.name
                );
            }
            run.already_applied += 1;
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in statements(&sql) {
            if let Some(caps) = ADD_COLUMN.as_ref().and_then(|re| re.captures(statement)) {
                let present: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
                        .bind(&caps[1])
                        .bind(&caps[2])
                        .fetch_optional(&mut *tx)
                        .await?;
                if present.is_some() {
                    continue;
                }
            }
            if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                error!(
                    target: LOG_TARGET,
                    event = "schema_migration_failed",
                    version = migration.version,
                    sql = %short(statement),
                    error = %err
                );
                return Err(err).with_context(|| {
                    format!("apply migration {:04}_{}", migration.version, migration.name)
                });
            }
        }
        sqlx::query(
            "INSERT INTO schema_migrations (version, name, checksum, applied_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(&checksum)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            target: LOG_TARGET,
            event = "schema_migration_applied",
            version = migration.version,
            name = migration.name
        );
        run.applied.push(migration.name);
    }
    Ok(run)
}

/// Highest applied schema version, or 0 on a database that was never migrated.
pub async fn current_schema_version(pool: &SqlitePool) -> anyhow::Result<i64> {
    let has_table: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
    )
    .fetch_optional(pool)
    .await?;
    if has_table.is_none() {
        return Ok(0);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}
