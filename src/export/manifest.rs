use std::collections::BTreeMap;

use serde_json::Value;

use crate::discovery::DiscoveryResult;
use crate::snapshot::{BundleManifest, SnapshotChecksums, TableManifestEntry};

/// Describe the exported tables in insert order. Tables discovery knows about
/// but that were not exported are left out.
pub fn build_manifest(
    discovery: &DiscoveryResult,
    data: &BTreeMap<String, Vec<Value>>,
    checksums: &SnapshotChecksums,
) -> BundleManifest {
    let foreign_key_order: Vec<String> = discovery
        .full_order()
        .into_iter()
        .filter(|t| data.contains_key(t))
        .collect();

    let tables = foreign_key_order
        .iter()
        .filter_map(|name| {
            let descriptor = discovery.get(name)?;
            Some(TableManifestEntry {
                name: name.clone(),
                category: descriptor.category,
                parent_table: descriptor.parent_table.clone(),
                parent_column: descriptor.parent_column.clone(),
                record_count: data.get(name).map(|rows| rows.len() as u64).unwrap_or(0),
                checksum: checksums.per_table.get(name).cloned().unwrap_or_default(),
                columns: descriptor.columns.iter().map(|c| c.name.clone()).collect(),
            })
        })
        .collect();

    BundleManifest {
        tables,
        foreign_key_order,
        discovered_at: discovery.discovered_at.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ColumnInfo, TableCategory, TableDescriptor};
    use crate::snapshot::compute_checksums;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn descriptor(name: &str, category: TableCategory, parent: Option<&str>) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            category,
            tenant_column_or_join_path: "clinic_id".to_string(),
            parent_table: parent.map(str::to_string),
            parent_column: parent.map(|_| "session_id".to_string()),
            parent_key: parent.map(|_| "id".to_string()),
            depends_on: parent.map(|p| BTreeSet::from([p.to_string()])).unwrap_or_default(),
            columns: vec![ColumnInfo {
                name: "id".into(),
                decl_type: "TEXT".into(),
                not_null: false,
                pk: 1,
            }],
            primary_key: vec!["id".into()],
            foreign_keys: Vec::new(),
            side_table: false,
        }
    }

    #[test]
    fn manifest_follows_discovery_order_for_exported_tables() {
        let discovery = DiscoveryResult {
            tables: vec![
                descriptor("chat_sessions", TableCategory::Direct, None),
                descriptor("chat_messages", TableCategory::Indirect, Some("chat_sessions")),
                descriptor("unused", TableCategory::Direct, None),
            ],
            foreign_key_order: vec![
                "chat_sessions".into(),
                "chat_messages".into(),
                "unused".into(),
            ],
            discovered_at: "2026-01-01T00:00:00.000Z".into(),
            side_tables: Vec::new(),
        };
        let mut data = BTreeMap::new();
        data.insert("chat_messages".to_string(), vec![json!({"id": "m1"})]);
        data.insert("chat_sessions".to_string(), vec![json!({"id": "s1"})]);
        let sums = compute_checksums(&data);

        let manifest = build_manifest(&discovery, &data, &sums);
        assert_eq!(manifest.foreign_key_order, vec!["chat_sessions", "chat_messages"]);
        let messages = manifest.table("chat_messages").unwrap();
        assert_eq!(messages.record_count, 1);
        assert_eq!(messages.parent_table.as_deref(), Some("chat_sessions"));
        assert_eq!(messages.checksum, sums.per_table["chat_messages"]);
        assert_eq!(messages.columns, vec!["id"]);
    }
}
