use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use super::OperationResult;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationReportFile<'a> {
    generated_at: String,
    operation: &'a str,
    source: &'a str,
    result: &'a OperationResult,
}

/// Persist a restore or import outcome as `<kind>-YYYYMMDD-HHMMSS.json`
/// under `reports_dir`. `source` names the snapshot id or bundle path.
pub fn write_operation_report(
    reports_dir: &Path,
    kind: &str,
    source: &str,
    result: &OperationResult,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let now = Utc::now();
    let file_name = format!("{kind}-{}.json", now.format("%Y%m%d-%H%M%S"));
    let path = reports_dir.join(file_name);
    let payload = OperationReportFile {
        generated_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        operation: kind,
        source,
        result,
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize operation report")?;
    fs::write(&path, json).with_context(|| format!("write operation report {}", path.display()))?;
    Ok(path)
}
