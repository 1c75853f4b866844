use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::SnapshotChecksums;

/// Rows are ordered by `id` (numbers before strings, numbers numerically),
/// then by their canonical text so duplicate or missing ids still sort stably.
fn compare_rows(a: &(Option<&Value>, String), b: &(Option<&Value>, String)) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            Some(Value::Number(_)) => 0,
            Some(Value::String(_)) => 1,
            Some(_) => 2,
            None => 3,
        }
    }
    let by_id = match (a.0, b.0) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .unwrap_or_default()
                    .total_cmp(&y.as_f64().unwrap_or_default()),
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (x, y) => rank(x).cmp(&rank(y)),
    };
    by_id.then_with(|| a.1.cmp(&b.1))
}

/// Compact JSON with object keys sorted at every level, whatever map
/// ordering serde_json was built with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// sha256 over the canonical, id-sorted serialization of a table's rows.
pub fn table_checksum(rows: &[Value]) -> String {
    let mut keyed: Vec<(Option<&Value>, String)> = rows
        .iter()
        .map(|row| (row.get("id"), canonical_json(row)))
        .collect();
    keyed.sort_by(compare_rows);

    let mut hasher = Sha256::new();
    for (_, text) in &keyed {
        hasher.update(text.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Aggregate over per-table hashes in table-name order.
pub fn bundle_checksum(per_table: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (table, hash) in per_table {
        hasher.update(table.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub fn compute_checksums(data: &BTreeMap<String, Vec<Value>>) -> SnapshotChecksums {
    let per_table: BTreeMap<String, String> = data
        .iter()
        .map(|(table, rows)| (table.clone(), table_checksum(rows)))
        .collect();
    SnapshotChecksums {
        bundle: bundle_checksum(&per_table),
        per_table,
    }
}
