#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::Arc;

use clinic_snapshot_lib::export::{ExportRequest, SnapshotExporter};
use clinic_snapshot_lib::import::{SnapshotRestorer, WorkspaceBundleImporter};
use clinic_snapshot_lib::snapshot::CreatedBy;
use clinic_snapshot_lib::storage::{MemorySnapshotStore, SnapshotStorageService};
use clinic_snapshot_lib::{migrate, SnapshotConfig, SnapshotType, TableDiscoveryService};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub const SHARED_CATEGORY: &str = "cat-shared";

/// In-memory database with the live clinic schema and one shared category.
pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    migrate::apply_migrations(&pool)
        .await
        .expect("apply clinic schema");
    sqlx::query(
        "INSERT INTO categories (id, clinic_id, entity_type, name, is_system) \
         VALUES (?1, NULL, 'expense', 'Rent', 1)",
    )
    .bind(SHARED_CATEGORY)
    .execute(&pool)
    .await
    .unwrap();
    pool
}

pub async fn seed_clinic(pool: &SqlitePool, workspace_id: &str, clinic_id: &str) {
    sqlx::query(
        "INSERT OR IGNORE INTO workspaces (id, name, slug, owner_id) VALUES (?1, 'Downtown Group', ?2, 'owner-1')",
    )
    .bind(workspace_id)
    .bind(format!("downtown-{workspace_id}"))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO clinics (id, workspace_id, name) VALUES (?1, ?2, 'Downtown Dental')")
        .bind(clinic_id)
        .bind(workspace_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Three patients, two services and five treatments, plus one expense filed
/// under the shared category and one clinic-owned category.
pub async fn seed_demo(pool: &SqlitePool, clinic_id: &str) {
    let p = |n: u32| format!("{clinic_id}-p{n}");
    let s = |n: u32| format!("{clinic_id}-s{n}");
    for n in 1..=3 {
        sqlx::query(
            "INSERT INTO patients (id, clinic_id, first_name, last_name, email, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'Doe', ?4, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
        )
        .bind(p(n))
        .bind(clinic_id)
        .bind(format!("Patient{n}"))
        .bind(format!("p{n}@example.com"))
        .execute(pool)
        .await
        .unwrap();
    }
    for n in 1..=2 {
        sqlx::query(
            "INSERT INTO services (id, clinic_id, name, est_minutes, price_cents) VALUES (?1, ?2, ?3, 45, ?4)",
        )
        .bind(s(n))
        .bind(clinic_id)
        .bind(format!("Service {n}"))
        .bind(10_000 * n as i64)
        .execute(pool)
        .await
        .unwrap();
    }
    for n in 1..=5u32 {
        sqlx::query(
            "INSERT INTO treatments (id, clinic_id, patient_id, service_id, treatment_date, price_cents) \
             VALUES (?1, ?2, ?3, ?4, '2024-02-01', 12000)",
        )
        .bind(format!("{clinic_id}-t{n}"))
        .bind(clinic_id)
        .bind(p(n % 3 + 1))
        .bind(s(n % 2 + 1))
        .execute(pool)
        .await
        .unwrap();
    }
    sqlx::query(
        "INSERT INTO categories (id, clinic_id, entity_type, name) VALUES (?1, ?2, 'expense', 'Lab')",
    )
    .bind(format!("{clinic_id}-cat"))
    .bind(clinic_id)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO expenses (id, clinic_id, category_id, expense_date, amount_cents) \
         VALUES (?1, ?2, ?3, '2024-02-02', 50000)",
    )
    .bind(format!("{clinic_id}-e1"))
    .bind(clinic_id)
    .bind(SHARED_CATEGORY)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn count(pool: &SqlitePool, table: &str, clinic_id: &str) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM \"{table}\" WHERE clinic_id = ?1"
    ))
    .bind(clinic_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn count_all(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub fn created_by() -> CreatedBy {
    CreatedBy {
        user_id: "user-1".into(),
        email: "owner@example.com".into(),
    }
}

pub fn export_request(clinic_id: &str) -> ExportRequest {
    ExportRequest {
        clinic_id: clinic_id.to_string(),
        snapshot_type: SnapshotType::Manual,
        created_by: created_by(),
    }
}

/// The engine pieces over one pool, backed by in-memory storage.
pub struct Engine {
    pub config: SnapshotConfig,
    pub discovery: Arc<TableDiscoveryService>,
    pub exporter: Arc<SnapshotExporter>,
    pub storage: SnapshotStorageService,
    pub restorer: SnapshotRestorer,
    pub importer: WorkspaceBundleImporter,
}

impl Engine {
    pub fn new(pool: &SqlitePool) -> Self {
        let config = SnapshotConfig {
            insert_chunk_size: 2,
            lookup_chunk_size: 2,
            ..SnapshotConfig::default()
        };
        let discovery = Arc::new(TableDiscoveryService::new(pool.clone()));
        let exporter = Arc::new(SnapshotExporter::new(
            pool.clone(),
            discovery.clone(),
            config.lookup_chunk_size,
        ));
        let storage = SnapshotStorageService::new(
            Arc::new(MemorySnapshotStore::new()),
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
        let importer = WorkspaceBundleImporter::new(pool.clone(), discovery.clone(), &config);
        Self {
            config,
            discovery,
            exporter,
            storage,
            restorer,
            importer,
        }
    }
}
