use std::collections::{BTreeMap, BTreeSet, HashMap};

use jsonschema::error::ValidationErrorKind as SchemaErrorKind;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::migrations::{MigrationPreview, Migrator};
use super::{MIN_SUPPORTED_APP_VERSION, ROWS_PER_SECOND};
use crate::error::{codes, AppError};
use crate::snapshot::{bundle_checksum, table_checksum, SnapshotBundle};
use crate::LOG_TARGET;

const BUNDLE_SCHEMA_SOURCE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/bundle-metadata.schema.json"
));

static BUNDLE_SCHEMA: Lazy<Result<JSONSchema, String>> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(BUNDLE_SCHEMA_SOURCE).map_err(|e| e.to_string())?;
    JSONSchema::compile(&schema).map_err(|e| e.to_string())
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    MissingField,
    InvalidSchema,
    ChecksumMismatch,
    UnsupportedVersion,
    UnknownTable,
    CountMismatch,
    InvalidType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    UnknownColumn,
    MissingId,
    InvalidMoney,
    DuplicateValue,
    MigrationRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationWarning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_records: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub records_to_import: u64,
    pub estimated_duration_secs: u64,
    pub disk_space_required_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
    pub stats: ValidationStats,
    pub migration_preview: MigrationPreview,
}

impl ValidationResult {
    pub fn checksum_failures(&self) -> Vec<String> {
        self.errors
            .iter()
            .filter(|e| e.kind == IssueKind::ChecksumMismatch)
            .map(|e| e.table.clone().unwrap_or_else(|| "bundle".to_string()))
            .collect()
    }
}

/// A failed validation, as raised by restore and import.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("checksum mismatch for {}", tables.join(", "))]
    ChecksumMismatch { tables: Vec<String> },
    #[error("bundle is invalid: {summary}")]
    Invalid {
        summary: String,
        issues: Vec<ValidationIssue>,
    },
}

impl ValidationError {
    /// `None` when the result is valid.
    pub fn from_result(result: &ValidationResult) -> Option<Self> {
        if result.valid {
            return None;
        }
        let tables = result.checksum_failures();
        if !tables.is_empty() {
            return Some(ValidationError::ChecksumMismatch { tables });
        }
        let summary = result
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Some(ValidationError::Invalid {
            summary,
            issues: result.errors.clone(),
        })
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match &err {
            ValidationError::ChecksumMismatch { tables } => {
                AppError::new(codes::CHECKSUM_MISMATCH, err.to_string())
                    .with_context("tables", tables.join(","))
            }
            ValidationError::Invalid { .. } => {
                AppError::new(codes::INVALID_SNAPSHOT, err.to_string())
            }
        }
    }
}

/// Pure checks over a bundle; touches neither storage nor the database.
#[derive(Debug, Clone)]
pub struct BundleValidator {
    migrator: Migrator,
    minimum_app_version: Version,
}

impl Default for BundleValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleValidator {
    pub fn new() -> Self {
        Self {
            migrator: Migrator::new(),
            minimum_app_version: Version::parse(MIN_SUPPORTED_APP_VERSION)
                .unwrap_or_else(|_| Version::new(0, 1, 0)),
        }
    }

    /// Unparseable versions leave the current minimum in place.
    pub fn with_minimum_app_version(mut self, version: &str) -> Self {
        if let Ok(parsed) = Version::parse(version) {
            self.minimum_app_version = parsed;
        }
        self
    }

    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn validate_bundle(&self, bundle: &SnapshotBundle) -> ValidationResult {
        match serde_json::to_value(bundle) {
            Ok(value) => self.validate_value(&value),
            Err(err) => invalid(vec![issue(
                IssueKind::InvalidSchema,
                None,
                None,
                format!("bundle could not be serialized: {err}"),
            )]),
        }
    }

    /// Structure first, then integrity, then soft data-quality warnings.
    pub fn validate_value(&self, value: &Value) -> ValidationResult {
        let structural = schema_issues(value);
        if !structural.is_empty() {
            debug!(target: LOG_TARGET, event = "bundle_schema_invalid", issues = structural.len());
            return invalid(structural);
        }

        let bundle: SnapshotBundle = match serde_json::from_value(value.clone()) {
            Ok(bundle) => bundle,
            Err(err) => {
                return invalid(vec![issue(
                    IssueKind::InvalidSchema,
                    None,
                    None,
                    format!("bundle does not match the expected shape: {err}"),
                )])
            }
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        check_tables_and_counts(&bundle, &mut errors);
        check_row_types(&bundle, &mut errors);
        check_checksums(&bundle, &mut errors);
        self.check_versions(&bundle, &mut errors, &mut warnings);
        data_quality_warnings(&bundle, &mut warnings);

        let records = bundle.total_records();
        let json_bytes = serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0);
        let stats = ValidationStats {
            records_to_import: records,
            estimated_duration_secs: records.div_ceil(ROWS_PER_SECOND),
            disk_space_required_mb: json_bytes.div_ceil(1024 * 1024),
        };

        let valid = errors.is_empty();
        if !valid {
            warn!(
                target: LOG_TARGET,
                event = "bundle_invalid",
                snapshot_id = %bundle.metadata.snapshot_id,
                errors = errors.len()
            );
        }
        ValidationResult {
            valid,
            errors,
            warnings,
            stats,
            migration_preview: self.migrator.preview(&bundle),
        }
    }

    fn check_versions(
        &self,
        bundle: &SnapshotBundle,
        errors: &mut Vec<ValidationIssue>,
        warnings: &mut Vec<ValidationWarning>,
    ) {
        let version = bundle.metadata.schema_version;
        if version > self.migrator.current_version() {
            errors.push(issue(
                IssueKind::UnsupportedVersion,
                None,
                Some("schemaVersion"),
                format!(
                    "bundle schema version {version} is newer than supported version {}",
                    self.migrator.current_version()
                ),
            ));
        } else if version < self.migrator.minimum_version() {
            errors.push(issue(
                IssueKind::UnsupportedVersion,
                None,
                Some("schemaVersion"),
                format!(
                    "bundle schema version {version} is older than minimum supported {}",
                    self.migrator.minimum_version()
                ),
            ));
        } else if version < self.migrator.current_version() {
            warnings.push(ValidationWarning {
                kind: WarningKind::MigrationRequired,
                table: None,
                message: format!(
                    "bundle schema version {version} will be migrated to {}",
                    self.migrator.current_version()
                ),
                affected_records: None,
            });
        }

        match Version::parse(&bundle.metadata.app_version) {
            Ok(found) if found < self.minimum_app_version => errors.push(issue(
                IssueKind::UnsupportedVersion,
                None,
                Some("appVersion"),
                format!(
                    "bundle app version {found} is older than minimum supported {}",
                    self.minimum_app_version
                ),
            )),
            Ok(_) => {}
            Err(err) => errors.push(issue(
                IssueKind::InvalidSchema,
                None,
                Some("appVersion"),
                format!(
                    "invalid app version {:?}: {err}",
                    bundle.metadata.app_version
                ),
            )),
        }
    }
}

fn issue(
    kind: IssueKind,
    table: Option<&str>,
    field: Option<&str>,
    message: String,
) -> ValidationIssue {
    ValidationIssue {
        kind,
        table: table.map(str::to_string),
        field: field.map(str::to_string),
        message,
    }
}

fn invalid(errors: Vec<ValidationIssue>) -> ValidationResult {
    ValidationResult {
        valid: false,
        errors,
        ..ValidationResult::default()
    }
}

fn schema_issues(value: &Value) -> Vec<ValidationIssue> {
    let schema = match &*BUNDLE_SCHEMA {
        Ok(schema) => schema,
        Err(err) => {
            return vec![issue(
                IssueKind::InvalidSchema,
                None,
                None,
                format!("bundle schema failed to compile: {err}"),
            )]
        }
    };
    let Err(errors) = schema.validate(value) else {
        return Vec::new();
    };
    errors
        .map(|err| {
            let path = err.instance_path.to_string();
            match &err.kind {
                SchemaErrorKind::Required { property } => {
                    let field = property.as_str().unwrap_or_default();
                    issue(
                        IssueKind::MissingField,
                        None,
                        Some(field),
                        format!("missing required field {field} at {path:?}"),
                    )
                }
                _ => issue(
                    IssueKind::InvalidSchema,
                    None,
                    Some(path.trim_start_matches('/')),
                    err.to_string(),
                ),
            }
        })
        .collect()
}

fn check_tables_and_counts(bundle: &SnapshotBundle, errors: &mut Vec<ValidationIssue>) {
    let counts = &bundle.metadata.record_counts;
    for (table, rows) in &bundle.data {
        match counts.get(table) {
            None => errors.push(issue(
                IssueKind::UnknownTable,
                Some(table),
                None,
                format!("table {table} has data but no declared record count"),
            )),
            Some(&declared) if declared != rows.len() as u64 => errors.push(issue(
                IssueKind::CountMismatch,
                Some(table),
                None,
                format!(
                    "table {table} declares {declared} records but carries {}",
                    rows.len()
                ),
            )),
            Some(_) => {}
        }
    }
    for table in counts.keys().filter(|t| !bundle.data.contains_key(*t)) {
        errors.push(issue(
            IssueKind::UnknownTable,
            Some(table),
            None,
            format!("table {table} is declared but has no data"),
        ));
    }
}

fn check_row_types(bundle: &SnapshotBundle, errors: &mut Vec<ValidationIssue>) {
    for (table, rows) in &bundle.data {
        let bad = rows.iter().filter(|r| !r.is_object()).count();
        if bad > 0 {
            errors.push(issue(
                IssueKind::InvalidType,
                Some(table),
                None,
                format!("table {table} has {bad} rows that are not objects"),
            ));
        }
    }
}

fn check_checksums(bundle: &SnapshotBundle, errors: &mut Vec<ValidationIssue>) {
    let declared = &bundle.metadata.checksums;
    let mut recomputed = BTreeMap::new();
    let mut table_failures = false;
    for (table, rows) in &bundle.data {
        let actual = table_checksum(rows);
        match declared.per_table.get(table) {
            Some(expected) if *expected == actual => {}
            Some(_) => {
                table_failures = true;
                errors.push(issue(
                    IssueKind::ChecksumMismatch,
                    Some(table),
                    None,
                    format!("checksum of table {table} does not match its contents"),
                ));
            }
            None => {
                table_failures = true;
                errors.push(issue(
                    IssueKind::ChecksumMismatch,
                    Some(table),
                    None,
                    format!("table {table} has no declared checksum"),
                ));
            }
        }
        recomputed.insert(table.clone(), actual);
    }
    if !table_failures && bundle_checksum(&recomputed) != declared.bundle {
        errors.push(issue(
            IssueKind::ChecksumMismatch,
            None,
            Some("checksums.bundle"),
            "bundle checksum does not match the table checksums".to_string(),
        ));
    }
}

fn is_money_column(column: &str) -> bool {
    column.ends_with("_cents")
}

fn data_quality_warnings(bundle: &SnapshotBundle, warnings: &mut Vec<ValidationWarning>) {
    for (table, rows) in &bundle.data {
        let known: Option<BTreeSet<&str>> = bundle
            .manifest
            .table(table)
            .filter(|entry| !entry.columns.is_empty())
            .map(|entry| entry.columns.iter().map(String::as_str).collect());

        let mut unknown_columns = BTreeSet::new();
        let mut unknown_rows = 0u64;
        let mut missing_id = 0u64;
        let mut bad_money = 0u64;
        for row in rows {
            let Some(obj) = row.as_object() else { continue };
            if let Some(known) = &known {
                let extra: Vec<&String> =
                    obj.keys().filter(|k| !known.contains(k.as_str())).collect();
                if !extra.is_empty() {
                    unknown_rows += 1;
                    unknown_columns.extend(extra.into_iter().cloned());
                }
            }
            if obj.get("id").map(Value::is_null).unwrap_or(true) {
                missing_id += 1;
            }
            let money_ok = obj
                .iter()
                .filter(|(k, v)| is_money_column(k) && !v.is_null())
                .all(|(_, v)| v.is_i64() || v.is_u64());
            if !money_ok {
                bad_money += 1;
            }
        }

        if unknown_rows > 0 {
            warnings.push(ValidationWarning {
                kind: WarningKind::UnknownColumn,
                table: Some(table.clone()),
                message: format!(
                    "table {table} has columns outside its manifest: {}",
                    unknown_columns.into_iter().collect::<Vec<_>>().join(", ")
                ),
                affected_records: Some(unknown_rows),
            });
        }
        if missing_id > 0 {
            warnings.push(ValidationWarning {
                kind: WarningKind::MissingId,
                table: Some(table.clone()),
                message: format!("table {table} has rows without an id"),
                affected_records: Some(missing_id),
            });
        }
        if bad_money > 0 {
            warnings.push(ValidationWarning {
                kind: WarningKind::InvalidMoney,
                table: Some(table.clone()),
                message: format!("table {table} has non-integer amounts in *_cents columns"),
                affected_records: Some(bad_money),
            });
        }
    }

    if let Some(patients) = bundle.data.get("patients") {
        let mut seen: HashMap<String, u64> = HashMap::new();
        for email in patients
            .iter()
            .filter_map(|r| r.get("email").and_then(Value::as_str))
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
        {
            *seen.entry(email).or_default() += 1;
        }
        let duplicates: u64 = seen.values().filter(|n| **n > 1).sum();
        if duplicates > 0 {
            warnings.push(ValidationWarning {
                kind: WarningKind::DuplicateValue,
                table: Some("patients".to_string()),
                message: "patients share email addresses".to_string(),
                affected_records: Some(duplicates),
            });
        }
    }
}
