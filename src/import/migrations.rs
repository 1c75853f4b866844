use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{codes, AppError};
use crate::snapshot::SnapshotBundle;
use crate::LOG_TARGET;

pub const CURRENT_SCHEMA_VERSION: i64 = 4;
pub const MIN_SUPPORTED_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("bundle schema version {found} is newer than supported version {current}")]
    FutureVersion { found: i64, current: i64 },
    #[error("bundle schema version {found} is older than minimum supported {minimum}")]
    Unsupported { found: i64, minimum: i64 },
    #[error("no migration path from version {from} to {to}")]
    NoPath { from: i64, to: i64 },
    #[error("migration step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },
    #[error("migration step {step} left invalid data: {}", messages.join("; "))]
    ValidationFailed { step: String, messages: Vec<String> },
}

impl From<MigrationError> for AppError {
    fn from(err: MigrationError) -> Self {
        let app = AppError::new(codes::MIGRATION_FAILED, err.to_string());
        match &err {
            MigrationError::StepFailed { step, .. } | MigrationError::ValidationFailed { step, .. } => {
                app.with_context("step", step.clone())
            }
            _ => app,
        }
    }
}

type ApplyFn = fn(&mut SnapshotBundle) -> Result<u64, String>;
type CheckFn = fn(&SnapshotBundle) -> Vec<String>;

/// One version bump. `apply` returns how many rows or tables it touched and
/// must be a no-op on data that already carries its marker.
#[derive(Clone)]
pub struct MigrationStep {
    pub from: i64,
    pub to: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub apply: ApplyFn,
    pub validate: Option<CheckFn>,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStepSummary {
    pub name: String,
    pub from_version: i64,
    pub to_version: i64,
    pub description: String,
}

impl From<&MigrationStep> for MigrationStepSummary {
    fn from(step: &MigrationStep) -> Self {
        Self {
            name: step.name.to_string(),
            from_version: step.from,
            to_version: step.to,
            description: step.description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPreview {
    pub needs_migration: bool,
    pub migrations_to_apply: Vec<String>,
    pub current_version: i64,
    pub target_version: i64,
    pub migrations_summary: Vec<MigrationStepSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOptions {
    pub validate_each_step: bool,
    pub continue_on_warnings: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            validate_each_step: true,
            continue_on_warnings: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedStep {
    pub name: String,
    pub from_version: i64,
    pub to_version: i64,
    pub changed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<AppliedStep>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSystemInfo {
    pub current_version: i64,
    pub minimum_supported_version: i64,
    pub steps: Vec<MigrationStepSummary>,
    pub registry_issues: Vec<String>,
}

fn ensure_tables(bundle: &mut SnapshotBundle, tables: &[&str]) -> u64 {
    let mut added = 0;
    for table in tables {
        if !bundle.data.contains_key(*table) {
            bundle.data.insert(table.to_string(), Vec::new());
            added += 1;
        }
    }
    added
}

fn add_quotes(bundle: &mut SnapshotBundle) -> Result<u64, String> {
    Ok(ensure_tables(bundle, &["quotes", "quote_items"]))
}

fn add_chat(bundle: &mut SnapshotBundle) -> Result<u64, String> {
    Ok(ensure_tables(
        bundle,
        &["chat_sessions", "chat_messages", "ai_feedback"],
    ))
}

fn backfill_treatment_status(bundle: &mut SnapshotBundle) -> Result<u64, String> {
    let mut changed = 0;
    if let Some(rows) = bundle.data.get_mut("treatments") {
        for (idx, row) in rows.iter_mut().enumerate() {
            let obj = row
                .as_object_mut()
                .ok_or_else(|| format!("treatments row {idx} is not an object"))?;
            let missing = obj.get("status").map(Value::is_null).unwrap_or(true);
            if missing {
                obj.insert("status".to_string(), Value::from("completed"));
                changed += 1;
            }
        }
    }
    if let Some(entry) = bundle
        .manifest
        .tables
        .iter_mut()
        .find(|t| t.name == "treatments")
    {
        if !entry.columns.is_empty() && !entry.columns.iter().any(|c| c == "status") {
            entry.columns.push("status".to_string());
        }
    }
    Ok(changed)
}

fn check_treatment_status(bundle: &SnapshotBundle) -> Vec<String> {
    let missing = bundle
        .data
        .get("treatments")
        .map(|rows| {
            rows.iter()
                .filter(|r| !r.get("status").map(Value::is_string).unwrap_or(false))
                .count()
        })
        .unwrap_or(0);
    if missing > 0 {
        vec![format!("{missing} treatments rows have no status")]
    } else {
        Vec::new()
    }
}

pub fn builtin_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            from: 1,
            to: 2,
            name: "add_quotes",
            description: "Add quotes and quote_items tables",
            apply: add_quotes,
            validate: None,
        },
        MigrationStep {
            from: 2,
            to: 3,
            name: "add_chat",
            description: "Add chat_sessions, chat_messages and ai_feedback tables",
            apply: add_chat,
            validate: None,
        },
        MigrationStep {
            from: 3,
            to: 4,
            name: "treatment_status",
            description: "Backfill treatments.status with \"completed\"",
            apply: backfill_treatment_status,
            validate: Some(check_treatment_status),
        },
    ]
}

/// Upgrades bundle data shape through ordered, version-keyed steps.
#[derive(Debug, Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
    current: i64,
    minimum: i64,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self::with_steps(
            builtin_steps(),
            CURRENT_SCHEMA_VERSION,
            MIN_SUPPORTED_SCHEMA_VERSION,
        )
    }

    pub fn with_steps(mut steps: Vec<MigrationStep>, current: i64, minimum: i64) -> Self {
        steps.sort_by_key(|s| (s.from, s.to));
        Self {
            steps,
            current,
            minimum,
        }
    }

    pub fn current_version(&self) -> i64 {
        self.current
    }

    pub fn minimum_version(&self) -> i64 {
        self.minimum
    }

    fn path(&self, from: i64) -> Result<Vec<&MigrationStep>, MigrationError> {
        if from > self.current {
            return Err(MigrationError::FutureVersion {
                found: from,
                current: self.current,
            });
        }
        if from < self.minimum {
            return Err(MigrationError::Unsupported {
                found: from,
                minimum: self.minimum,
            });
        }
        let mut path = Vec::new();
        let mut at = from;
        while at < self.current {
            let step = self
                .steps
                .iter()
                .find(|s| s.from == at && s.to > at)
                .ok_or(MigrationError::NoPath {
                    from: at,
                    to: self.current,
                })?;
            path.push(step);
            at = step.to;
        }
        if at != self.current {
            return Err(MigrationError::NoPath {
                from,
                to: self.current,
            });
        }
        Ok(path)
    }

    pub fn can_migrate(&self, version: i64) -> bool {
        self.path(version).is_ok()
    }

    /// What `migrate` would do, computed without touching the bundle.
    pub fn preview(&self, bundle: &SnapshotBundle) -> MigrationPreview {
        let version = bundle.metadata.schema_version;
        let steps = self.path(version).unwrap_or_default();
        MigrationPreview {
            needs_migration: !steps.is_empty(),
            migrations_to_apply: steps.iter().map(|s| s.name.to_string()).collect(),
            current_version: version,
            target_version: self.current,
            migrations_summary: steps.iter().map(|s| MigrationStepSummary::from(*s)).collect(),
        }
    }

    /// Migrate a copy of `bundle`. The input is never touched, so a failing
    /// step leaves nothing half-applied. Counts and checksums of the result
    /// are recomputed.
    pub fn migrate(
        &self,
        bundle: &SnapshotBundle,
        options: MigrateOptions,
    ) -> Result<(SnapshotBundle, MigrationReport), MigrationError> {
        let from = bundle.metadata.schema_version;
        let steps = self.path(from)?;
        let mut report = MigrationReport {
            from_version: from,
            to_version: self.current,
            ..MigrationReport::default()
        };
        if steps.is_empty() {
            return Ok((bundle.clone(), report));
        }

        let mut working = bundle.clone();
        for step in steps {
            let changed = (step.apply)(&mut working).map_err(|reason| {
                warn!(
                    target: LOG_TARGET,
                    event = "bundle_migration_step_failed",
                    step = step.name,
                    error = %reason
                );
                MigrationError::StepFailed {
                    step: step.name.to_string(),
                    reason,
                }
            })?;

            if options.validate_each_step {
                if let Some(check) = step.validate {
                    let messages = check(&working);
                    if !messages.is_empty() {
                        if options.continue_on_warnings {
                            report.warnings.extend(
                                messages.into_iter().map(|m| format!("{}: {m}", step.name)),
                            );
                        } else {
                            return Err(MigrationError::ValidationFailed {
                                step: step.name.to_string(),
                                messages,
                            });
                        }
                    }
                }
            }

            working.metadata.schema_version = step.to;
            info!(
                target: LOG_TARGET,
                event = "bundle_migration_step",
                step = step.name,
                from = step.from,
                to = step.to,
                changed
            );
            report.applied.push(AppliedStep {
                name: step.name.to_string(),
                from_version: step.from,
                to_version: step.to,
                changed,
            });
        }

        working.refresh_integrity();
        Ok((working, report))
    }

    pub fn apply_migrations(
        &self,
        bundle: &SnapshotBundle,
    ) -> Result<(SnapshotBundle, MigrationReport), MigrationError> {
        self.migrate(bundle, MigrateOptions::default())
    }

    /// Structural problems in the step list: gaps, duplicates, steps that do
    /// not advance by exactly one version.
    pub fn validate_registry(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.from) {
                issues.push(format!("duplicate step from version {}", step.from));
            }
            if step.to != step.from + 1 {
                issues.push(format!(
                    "step {} goes from {} to {}, expected {}",
                    step.name,
                    step.from,
                    step.to,
                    step.from + 1
                ));
            }
        }
        for version in self.minimum..self.current {
            if !seen.contains(&version) {
                issues.push(format!("no step from version {version}"));
            }
        }
        issues
    }

    pub fn system_info(&self) -> MigrationSystemInfo {
        MigrationSystemInfo {
            current_version: self.current,
            minimum_supported_version: self.minimum,
            steps: self.steps.iter().map(MigrationStepSummary::from).collect(),
            registry_issues: self.validate_registry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{bundle_checksum, compute_checksums};
    use serde_json::json;

    fn bundle_at(version: i64, data: Value) -> SnapshotBundle {
        let mut bundle: SnapshotBundle = serde_json::from_value(json!({
            "metadata": {
                "snapshotId": "s1", "clinicId": "c1", "workspaceId": "w1",
                "createdAt": "2025-06-01T00:00:00.000Z", "schemaVersion": version,
                "appVersion": "0.1.0", "recordCounts": {},
                "checksums": {"bundle": "", "perTable": {}}
            },
            "data": data
        }))
        .unwrap();
        bundle.refresh_integrity();
        bundle
    }

    #[test]
    fn preview_lists_pending_steps_without_mutation() {
        let migrator = Migrator::new();
        let bundle = bundle_at(2, json!({"treatments": [{"id": "t1"}]}));
        let before = bundle.clone();
        let preview = migrator.preview(&bundle);
        assert!(preview.needs_migration);
        assert_eq!(preview.migrations_to_apply, vec!["add_chat", "treatment_status"]);
        assert_eq!(preview.current_version, 2);
        assert_eq!(preview.target_version, 4);
        assert_eq!(bundle, before);
    }

    #[test]
    fn migrate_from_v1_adds_tables_and_backfills() {
        let migrator = Migrator::new();
        let bundle = bundle_at(1, json!({"treatments": [{"id": "t1"}, {"id": "t2", "status": "planned"}]}));
        let (migrated, report) = migrator.apply_migrations(&bundle).unwrap();

        assert_eq!(migrated.metadata.schema_version, 4);
        assert_eq!(report.applied.len(), 3);
        for table in ["quotes", "quote_items", "chat_sessions", "chat_messages", "ai_feedback"] {
            assert!(migrated.data.contains_key(table), "{table} missing");
        }
        let rows = &migrated.data["treatments"];
        assert_eq!(rows[0]["status"], "completed");
        assert_eq!(rows[1]["status"], "planned");
        assert_eq!(migrated.metadata.record_counts["quotes"], 0);
        assert_eq!(migrated.metadata.checksums, compute_checksums(&migrated.data));
        assert_eq!(
            migrated.metadata.checksums.bundle,
            bundle_checksum(&migrated.metadata.checksums.per_table)
        );
        assert_eq!(bundle.metadata.schema_version, 1);
    }

    #[test]
    fn steps_are_idempotent() {
        let mut bundle = bundle_at(3, json!({"treatments": [{"id": "t1"}]}));
        assert_eq!(backfill_treatment_status(&mut bundle).unwrap(), 1);
        let once = bundle.clone();
        assert_eq!(backfill_treatment_status(&mut bundle).unwrap(), 0);
        assert_eq!(bundle, once);

        assert_eq!(add_chat(&mut bundle).unwrap(), 3);
        assert_eq!(add_chat(&mut bundle).unwrap(), 0);
    }

    #[test]
    fn current_version_is_a_no_op() {
        let migrator = Migrator::new();
        let bundle = bundle_at(4, json!({"patients": []}));
        let (out, report) = migrator.apply_migrations(&bundle).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(out, bundle);
        assert!(!migrator.preview(&bundle).needs_migration);
    }

    #[test]
    fn unsupported_versions_are_rejected() {
        let migrator = Migrator::new();
        assert!(matches!(
            migrator.apply_migrations(&bundle_at(9, json!({}))),
            Err(MigrationError::FutureVersion { found: 9, .. })
        ));
        assert!(matches!(
            migrator.apply_migrations(&bundle_at(0, json!({}))),
            Err(MigrationError::Unsupported { found: 0, .. })
        ));
        assert!(migrator.can_migrate(1));
        assert!(!migrator.can_migrate(5));
    }

    #[test]
    fn failing_step_aborts_and_leaves_input_untouched() {
        let migrator = Migrator::new();
        let bundle = bundle_at(3, json!({"treatments": ["not an object"]}));
        let err = migrator.apply_migrations(&bundle).unwrap_err();
        assert!(matches!(err, MigrationError::StepFailed { .. }));
        assert_eq!(AppError::from(err).code(), codes::MIGRATION_FAILED);
        assert_eq!(bundle.data["treatments"][0], json!("not an object"));
    }

    #[test]
    fn step_validation_can_be_downgraded_to_warnings() {
        fn noop(_: &mut SnapshotBundle) -> Result<u64, String> {
            Ok(0)
        }
        fn always_complains(_: &SnapshotBundle) -> Vec<String> {
            vec!["suspicious".to_string()]
        }
        let migrator = Migrator::with_steps(
            vec![MigrationStep {
                from: 1,
                to: 2,
                name: "noop",
                description: "",
                apply: noop,
                validate: Some(always_complains),
            }],
            2,
            1,
        );
        let bundle = bundle_at(1, json!({}));
        assert!(matches!(
            migrator.migrate(&bundle, MigrateOptions::default()),
            Err(MigrationError::ValidationFailed { .. })
        ));
        let (_, report) = migrator
            .migrate(
                &bundle,
                MigrateOptions {
                    validate_each_step: true,
                    continue_on_warnings: true,
                },
            )
            .unwrap();
        assert_eq!(report.warnings, vec!["noop: suspicious"]);
    }

    #[test]
    fn registry_problems_are_reported() {
        assert!(Migrator::new().validate_registry().is_empty());
        fn noop(_: &mut SnapshotBundle) -> Result<u64, String> {
            Ok(0)
        }
        let step = |from, to| MigrationStep {
            from,
            to,
            name: "s",
            description: "",
            apply: noop,
            validate: None,
        };
        let migrator = Migrator::with_steps(vec![step(1, 3), step(1, 2)], 4, 1);
        let issues = migrator.validate_registry();
        assert!(issues.iter().any(|i| i.contains("duplicate")));
        assert!(issues.iter().any(|i| i.contains("expected 2")));
        assert!(issues.iter().any(|i| i.contains("no step from version 2")));
        assert!(!migrator.system_info().registry_issues.is_empty());
    }
}
