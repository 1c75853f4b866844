use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable codes surfaced by the snapshot engine.
pub mod codes {
    pub const DISCOVERY_FAILED: &str = "SNAPSHOT/DISCOVERY_FAILED";
    pub const EXPORT_FAILED: &str = "SNAPSHOT/EXPORT_FAILED";
    pub const STORAGE_UPLOAD_FAILED: &str = "SNAPSHOT/STORAGE_UPLOAD_FAILED";
    pub const STORAGE_DOWNLOAD_FAILED: &str = "SNAPSHOT/STORAGE_DOWNLOAD_FAILED";
    pub const NOT_FOUND: &str = "SNAPSHOT/NOT_FOUND";
    pub const CHECKSUM_MISMATCH: &str = "SNAPSHOT/CHECKSUM_MISMATCH";
    pub const INVALID_SNAPSHOT: &str = "SNAPSHOT/INVALID_SNAPSHOT";
    pub const QUOTA_EXCEEDED: &str = "SNAPSHOT/QUOTA_EXCEEDED";
    pub const MIGRATION_FAILED: &str = "SNAPSHOT/MIGRATION_FAILED";
    pub const RESTORE_FAILED: &str = "SNAPSHOT/RESTORE_FAILED";
    pub const IMPORT_FAILED: &str = "SNAPSHOT/IMPORT_FAILED";
    pub const PERMISSION_DENIED: &str = "SNAPSHOT/PERMISSION_DENIED";

    /// Code for errors that carry no more specific classification.
    pub const UNKNOWN: &str = "SNAPSHOT/UNKNOWN";
}

/// Error handed across the crate boundary: to the CLI, to reports and to any
/// embedding service. Component errors convert into it with a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Ids, table names and limits; never row payloads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Whether repeating the same call can succeed without operator action.
    ///
    /// Storage transfers and pool exhaustion are transient; everything else
    /// (bad bundles, quota, permissions, schema problems) needs a change first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::STORAGE_UPLOAD_FAILED | codes::STORAGE_DOWNLOAD_FAILED | "SQLX/POOL_TIMEOUT"
        ) || self.code.starts_with("IO/")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        for (key, value) in &self.context {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        fn walk(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            let mut node = AppError::new(codes::UNKNOWN, err.to_string());
            node.cause = err.source().map(|source| Box::new(walk(source)));
            node
        }
        walk(error.as_ref())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        let app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match error.raw_os_error() {
            Some(os_code) => app_error.with_context("os_code", os_code.to_string()),
            None => app_error,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        use serde_json::error::Category;
        let code = match error.classify() {
            Category::Io => "JSON/IO",
            Category::Syntax => "JSON/SYNTAX",
            Category::Data => "JSON/DATA",
            Category::Eof => "JSON/EOF",
        };
        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            sqlx::Error::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            sqlx::Error::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            sqlx::Error::PoolClosed => {
                AppError::new("SQLX/POOL_CLOSED", "Database pool is closed")
            }
            sqlx::Error::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            sqlx::Error::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("SQLX/SQLITE_{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let app_error = AppError::new(code, db.message().to_string());
                match db.constraint() {
                    Some(constraint) => app_error.with_context("constraint", constraint),
                    None => app_error,
                }
            }
            sqlx::Error::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column", index.to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn context_and_cause_survive_serialization() {
        let error = AppError::new(codes::RESTORE_FAILED, "restore aborted")
            .with_context("clinic_id", "clinic-a")
            .with_context("table", "treatments")
            .with_cause(AppError::new("SQLX/SQLITE_787", "FOREIGN KEY constraint failed"));

        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["code"], codes::RESTORE_FAILED);
        assert_eq!(value["context"]["table"], "treatments");
        assert_eq!(value["cause"]["code"], "SQLX/SQLITE_787");

        let back: AppError = serde_json::from_value(value).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn display_lists_context_in_key_order() {
        let error = AppError::new(codes::QUOTA_EXCEEDED, "bundle too large")
            .with_context("limit", "10")
            .with_context("bytes", "11");
        assert_eq!(
            error.to_string(),
            "[SNAPSHOT/QUOTA_EXCEEDED] bundle too large bytes=11 limit=10"
        );
    }

    #[test]
    fn anyhow_chain_becomes_nested_causes() {
        let inner = AppError::new(codes::NOT_FOUND, "snapshot missing");
        let err = Err::<(), _>(anyhow::Error::from(inner.clone()))
            .context("load snapshot for restore")
            .unwrap_err();

        let converted = AppError::from(err);
        assert_eq!(converted.code(), codes::UNKNOWN);
        assert_eq!(converted.message(), "load snapshot for restore");
        assert_eq!(converted.cause(), Some(&inner));
    }

    #[test]
    fn only_transfer_failures_are_retryable() {
        assert!(AppError::new(codes::STORAGE_DOWNLOAD_FAILED, "x").is_retryable());
        assert!(AppError::from(std::io::Error::from_raw_os_error(2)).is_retryable());
        assert!(!AppError::new(codes::CHECKSUM_MISMATCH, "x").is_retryable());
        assert!(!AppError::new(codes::QUOTA_EXCEEDED, "x").is_retryable());
    }

    #[test]
    fn json_errors_carry_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"metadata\": }").unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert_eq!(app_error.context().get("line").map(String::as_str), Some("1"));
    }

    #[test]
    fn missing_rows_map_to_a_specific_code() {
        assert_eq!(AppError::from(sqlx::Error::RowNotFound).code(), "SQLX/ROW_NOT_FOUND");
    }
}
