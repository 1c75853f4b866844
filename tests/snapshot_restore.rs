use anyhow::{Context, Result};
use clinic_snapshot_lib::import::{BundleValidator, RestoreMode, RestoreOptions};
use clinic_snapshot_lib::snapshot::pack_bundle;
use clinic_snapshot_lib::SnapshotType;
use serde_json::json;

mod util;

use util::{count, count_all, created_by, export_request, seed_clinic, seed_demo, temp_pool, Engine};

async fn seed_quote(pool: &sqlx::SqlitePool, clinic_id: &str, quote: &str, item: &str) {
    sqlx::query("INSERT INTO quotes (id, clinic_id, patient_id, total_cents) VALUES (?1, ?2, ?3, 24000)")
        .bind(quote)
        .bind(clinic_id)
        .bind(format!("{clinic_id}-p1"))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO quote_items (id, quote_id, service_id, qty, price_cents) VALUES (?1, ?2, ?3, 2, 12000)",
    )
    .bind(item)
    .bind(quote)
    .bind(format!("{clinic_id}-s1"))
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn export_then_replace_restore_onto_empty_clinic() -> Result<()> {
    let source = temp_pool().await;
    seed_clinic(&source, "ws-1", "clinic-a").await;
    seed_demo(&source, "clinic-a").await;
    let bundle = Engine::new(&source).exporter.export(&export_request("clinic-a")).await?;

    assert_eq!(bundle.metadata.record_counts.get("patients"), Some(&3));
    assert_eq!(bundle.metadata.record_counts.get("treatments"), Some(&5));
    assert_eq!(bundle.metadata.record_counts.get("services"), Some(&2));
    // Shared categories stay out of the bundle.
    assert_eq!(bundle.metadata.record_counts.get("categories"), Some(&1));

    let target = temp_pool().await;
    seed_clinic(&target, "ws-1", "clinic-a").await;
    let engine = Engine::new(&target);
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;
    let result = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &RestoreOptions::default())
        .await;

    assert!(result.success, "restore failed: {:?}", result.errors);
    assert_eq!(result.restored_or_imported_records.get("patients"), Some(&3));
    assert_eq!(result.restored_or_imported_records.get("treatments"), Some(&5));
    let backup_id = result
        .pre_restore_snapshot_id
        .clone()
        .context("pre-restore backup id")?;
    let backup = engine
        .storage
        .get_metadata("clinic-a", &backup_id)?
        .context("backup registered")?;
    assert_eq!(backup.snapshot_type, SnapshotType::PreRestore);
    assert_eq!(backup.total_records(), 0);

    assert_eq!(count(&target, "patients", "clinic-a").await, 3);
    assert_eq!(count(&target, "treatments", "clinic-a").await, 5);

    // Row-for-row: a fresh export of the target hashes the same.
    let again = engine.exporter.export(&export_request("clinic-a")).await?;
    assert_eq!(again.metadata.checksums.per_table, bundle.metadata.checksums.per_table);
    Ok(())
}

#[tokio::test]
async fn tampered_bundle_is_rejected_before_any_write() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let mut bundle = engine.exporter.export(&export_request("clinic-a")).await?;

    bundle.data.get_mut("patients").context("patients")?[0]["first_name"] = json!("Mallory");
    let report = BundleValidator::new().validate_bundle(&bundle);
    assert!(!report.valid);
    assert!(report.checksum_failures().contains(&"patients".to_string()));

    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;
    let result = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &RestoreOptions::default())
        .await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.fatal));
    assert!(result.pre_restore_snapshot_id.is_none());
    assert!(engine.storage.list_snapshots("clinic-a")?.is_empty());
    assert_eq!(count(&pool, "patients", "clinic-a").await, 3);
    Ok(())
}

#[tokio::test]
async fn dry_run_matches_real_run_and_writes_nothing() -> Result<()> {
    let source = temp_pool().await;
    seed_clinic(&source, "ws-1", "clinic-a").await;
    seed_demo(&source, "clinic-a").await;
    let bundle = Engine::new(&source).exporter.export(&export_request("clinic-a")).await?;

    let target = temp_pool().await;
    seed_clinic(&target, "ws-1", "clinic-a").await;
    seed_demo(&target, "clinic-a").await;
    sqlx::query(
        "INSERT INTO patients (id, clinic_id, first_name, last_name) VALUES ('extra', 'clinic-a', 'Late', 'Arrival')",
    )
    .execute(&target)
    .await?;
    let engine = Engine::new(&target);
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    let dry = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                dry_run: true,
                ..RestoreOptions::default()
            },
        )
        .await;
    assert!(dry.success, "dry run failed: {:?}", dry.errors);
    assert!(dry.dry_run);
    assert_eq!(count(&target, "patients", "clinic-a").await, 4);
    assert!(dry.pre_restore_snapshot_id.is_none());
    assert!(engine.storage.list_snapshots("clinic-a")?.is_empty());

    let real = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &RestoreOptions::default())
        .await;
    assert!(real.success, "restore failed: {:?}", real.errors);
    assert_eq!(dry.restored_or_imported_records, real.restored_or_imported_records);
    assert_eq!(dry.skipped_records, real.skipped_records);
    assert_eq!(dry.deleted_records, real.deleted_records);
    assert_eq!(real.deleted_records.get("patients"), Some(&4));
    assert_eq!(count(&target, "patients", "clinic-a").await, 3);

    for overwrite in [false, true] {
        sqlx::query("UPDATE patients SET first_name = 'Edited' WHERE id = 'clinic-a-p1'")
            .execute(&target)
            .await?;
        let merge = RestoreOptions {
            mode: RestoreMode::Merge,
            overwrite,
            create_backup_first: false,
            ..RestoreOptions::default()
        };
        let dry = engine
            .restorer
            .restore(
                &packed.bytes,
                "clinic-a",
                &created_by(),
                &RestoreOptions {
                    dry_run: true,
                    ..merge.clone()
                },
            )
            .await;
        assert!(dry.success, "dry merge failed: {:?}", dry.errors);
        let name: String =
            sqlx::query_scalar("SELECT first_name FROM patients WHERE id = 'clinic-a-p1'")
                .fetch_one(&target)
                .await?;
        assert_eq!(name, "Edited");

        let real = engine
            .restorer
            .restore(&packed.bytes, "clinic-a", &created_by(), &merge)
            .await;
        assert!(real.success, "merge failed: {:?}", real.errors);
        assert_eq!(dry.restored_or_imported_records, real.restored_or_imported_records);
        assert_eq!(dry.skipped_records, real.skipped_records);
        assert_eq!(dry.warnings, real.warnings);
    }
    let name: String =
        sqlx::query_scalar("SELECT first_name FROM patients WHERE id = 'clinic-a-p1'")
            .fetch_one(&target)
            .await?;
    assert_eq!(name, "Patient1");
    Ok(())
}

#[tokio::test]
async fn merge_keeps_local_rows_unless_overwrite() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await?;
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    sqlx::query("UPDATE patients SET first_name = 'Edited' WHERE id = 'clinic-a-p1'")
        .execute(&pool)
        .await?;
    let merge = RestoreOptions {
        mode: RestoreMode::Merge,
        create_backup_first: false,
        ..RestoreOptions::default()
    };
    let kept = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &merge)
        .await;
    assert!(kept.success, "merge failed: {:?}", kept.errors);
    assert_eq!(kept.skipped_records.get("patients"), Some(&3));
    let name: String =
        sqlx::query_scalar("SELECT first_name FROM patients WHERE id = 'clinic-a-p1'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(name, "Edited");

    let overwritten = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                overwrite: true,
                ..merge
            },
        )
        .await;
    assert!(overwritten.success, "overwrite failed: {:?}", overwritten.errors);
    assert_eq!(overwritten.restored_or_imported_records.get("patients"), Some(&3));
    let name: String =
        sqlx::query_scalar("SELECT first_name FROM patients WHERE id = 'clinic-a-p1'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(name, "Patient1");
    Ok(())
}

#[tokio::test]
async fn replace_leaves_shared_rows_and_other_tables_alone() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await?;
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    let result = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                tables: Some(vec!["categories".into(), "expenses".into()]),
                create_backup_first: false,
                ..RestoreOptions::default()
            },
        )
        .await;
    assert!(result.success, "restore failed: {:?}", result.errors);
    assert_eq!(result.restored_or_imported_records.get("categories"), Some(&1));
    assert_eq!(result.restored_or_imported_records.get("expenses"), Some(&1));
    assert!(result.restored_or_imported_records.get("patients").is_none());
    assert_eq!(count_all(&pool, "categories").await, 2);
    assert_eq!(count(&pool, "treatments", "clinic-a").await, 5);
    Ok(())
}

#[tokio::test]
async fn bundle_for_another_clinic_is_refused() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_clinic(&pool, "ws-1", "clinic-b").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await?;
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    let result = engine
        .restorer
        .restore(&packed.bytes, "clinic-b", &created_by(), &RestoreOptions::default())
        .await;
    assert!(!result.success);
    assert!(result.errors[0].message.starts_with("CLINIC_MISMATCH"));
    assert_eq!(count(&pool, "patients", "clinic-b").await, 0);
    assert!(engine.storage.list_snapshots("clinic-b")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn old_bundles_are_migrated_before_restore() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let mut bundle = engine.exporter.export(&export_request("clinic-a")).await?;

    // Shape of a v3 bundle: no treatment status yet.
    for row in bundle.data.get_mut("treatments").context("treatments")? {
        if let Some(obj) = row.as_object_mut() {
            obj.remove("status");
        }
    }
    bundle.metadata.schema_version = 3;
    bundle.refresh_integrity();
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    let result = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                create_backup_first: false,
                ..RestoreOptions::default()
            },
        )
        .await;
    assert!(result.success, "restore failed: {:?}", result.errors);
    assert!(result.warnings.iter().any(|w| w.contains("migrated")));
    let completed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM treatments WHERE status = 'completed'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(completed, 5);
    Ok(())
}

#[tokio::test]
async fn replacing_a_parent_table_requires_its_dependents() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    seed_quote(&pool, "clinic-a", "qa", "qi1").await;
    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await?;
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;
    let only = |tables: &[&str]| RestoreOptions {
        tables: Some(tables.iter().map(|t| t.to_string()).collect()),
        ..RestoreOptions::default()
    };

    // Clearing quotes would cascade into quote_items.
    let refused = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &only(&["quotes"]))
        .await;
    assert!(!refused.success);
    assert!(refused.errors[0].message.contains("quote_items"));
    assert!(refused.pre_restore_snapshot_id.is_none());
    assert!(engine.storage.list_snapshots("clinic-a")?.is_empty());
    assert_eq!(count_all(&pool, "quote_items").await, 1);

    // Treatments point at services without a cascade.
    let refused = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &only(&["services"]))
        .await;
    assert!(!refused.success);
    assert!(refused.errors[0].message.contains("treatments"));
    assert_eq!(count(&pool, "services", "clinic-a").await, 2);

    sqlx::query("UPDATE quote_items SET qty = 9 WHERE id = 'qi1'")
        .execute(&pool)
        .await?;
    let result = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &only(&["quotes", "quote_items"]),
        )
        .await;
    assert!(result.success, "restore failed: {:?}", result.errors);
    assert_eq!(result.restored_or_imported_records.get("quotes"), Some(&1));
    assert_eq!(result.restored_or_imported_records.get("quote_items"), Some(&1));
    let qty: i64 = sqlx::query_scalar("SELECT qty FROM quote_items WHERE id = 'qi1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(qty, 2);
    assert_eq!(count(&pool, "treatments", "clinic-a").await, 5);
    Ok(())
}

#[tokio::test]
async fn merge_overwrite_never_reaches_another_clinic() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_clinic(&pool, "ws-1", "clinic-b").await;
    seed_demo(&pool, "clinic-a").await;
    seed_demo(&pool, "clinic-b").await;
    seed_quote(&pool, "clinic-a", "qa", "qi1").await;
    seed_quote(&pool, "clinic-b", "qb", "qi2").await;
    let engine = Engine::new(&pool);
    let mut bundle = engine.exporter.export(&export_request("clinic-a")).await?;

    // A child row planted under clinic-b's quote.
    bundle.data.get_mut("quote_items").context("quote_items")?.push(json!({
        "id": "qi-planted",
        "quote_id": "qb",
        "service_id": "clinic-a-s1",
        "qty": 1,
        "price_cents": 1
    }));
    bundle.refresh_integrity();
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    // qi1 now belongs to clinic-b.
    sqlx::query("UPDATE quote_items SET quote_id = 'qb', price_cents = 99 WHERE id = 'qi1'")
        .execute(&pool)
        .await?;

    let result = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                mode: RestoreMode::Merge,
                overwrite: true,
                create_backup_first: false,
                ..RestoreOptions::default()
            },
        )
        .await;
    assert!(result.success, "merge failed: {:?}", result.errors);
    assert_eq!(result.skipped_records.get("quote_items"), Some(&2));
    assert!(result.warnings.iter().any(|w| w.contains("another clinic holds")));
    assert!(result.warnings.iter().any(|w| w.contains("parents outside")));

    let (quote_id, price): (String, i64) =
        sqlx::query_as("SELECT quote_id, price_cents FROM quote_items WHERE id = 'qi1'")
            .fetch_one(&pool)
            .await?;
    assert_eq!((quote_id.as_str(), price), ("qb", 99));
    assert_eq!(count_all(&pool, "quote_items").await, 2);
    assert_eq!(count(&pool, "patients", "clinic-b").await, 3);
    Ok(())
}

#[tokio::test]
async fn feedback_travels_with_its_messages() -> Result<()> {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    sqlx::query("INSERT INTO chat_sessions (id, clinic_id, user_id, title) VALUES ('cs1', 'clinic-a', 'user-1', 'Pricing')")
        .execute(&pool)
        .await?;
    for (id, role) in [("m1", "user"), ("m2", "assistant")] {
        sqlx::query("INSERT INTO chat_messages (id, session_id, role, content) VALUES (?1, 'cs1', ?2, 'hello')")
            .bind(id)
            .bind(role)
            .execute(&pool)
            .await?;
    }
    sqlx::query(
        "INSERT INTO ai_feedback (id, message_id, rating, comment) VALUES \
         ('f1', 'm2', 5, 'helpful'), ('f-pruned', 'gone', 1, NULL)",
    )
    .execute(&pool)
    .await?;

    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await?;
    assert_eq!(bundle.metadata.record_counts.get("chat_messages"), Some(&2));
    assert_eq!(bundle.metadata.record_counts.get("ai_feedback"), Some(&1));
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes)?;

    sqlx::query("UPDATE ai_feedback SET rating = 1 WHERE id = 'f1'")
        .execute(&pool)
        .await?;
    let result = engine
        .restorer
        .restore(
            &packed.bytes,
            "clinic-a",
            &created_by(),
            &RestoreOptions {
                create_backup_first: false,
                ..RestoreOptions::default()
            },
        )
        .await;
    assert!(result.success, "restore failed: {:?}", result.errors);
    assert_eq!(result.deleted_records.get("ai_feedback"), Some(&1));
    assert_eq!(result.restored_or_imported_records.get("ai_feedback"), Some(&1));
    let rating: i64 = sqlx::query_scalar("SELECT rating FROM ai_feedback WHERE id = 'f1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(rating, 5);
    // Feedback on messages outside the clinic is left alone.
    assert_eq!(count_all(&pool, "ai_feedback").await, 2);
    Ok(())
}
