use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::discovery::TableCategory;

pub mod checksum;
pub mod codec;

pub use checksum::{bundle_checksum, canonical_json, compute_checksums, table_checksum};
pub use codec::{pack_bundle, read_bundle_value, CodecError, PackedBundle, SNAPSHOT_ENTRY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    #[default]
    Manual,
    Auto,
    PreRestore,
}

impl SnapshotType {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotType::Manual => "manual",
            SnapshotType::Auto => "auto",
            SnapshotType::PreRestore => "pre_restore",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBy {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChecksums {
    pub bundle: String,
    pub per_table: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSizes {
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub clinic_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub clinic_name: String,
    #[serde(default)]
    pub workspace_name: String,
    pub created_at: String,
    #[serde(default)]
    pub created_by: CreatedBy,
    #[serde(rename = "type", default)]
    pub snapshot_type: SnapshotType,
    pub schema_version: i64,
    pub app_version: String,
    pub record_counts: BTreeMap<String, u64>,
    pub checksums: SnapshotChecksums,
    #[serde(default)]
    pub sizes: SnapshotSizes,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SnapshotMetadata {
    pub fn total_records(&self) -> u64 {
        self.record_counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableManifestEntry {
    pub name: String,
    pub category: TableCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_column: Option<String>,
    pub record_count: u64,
    pub checksum: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    #[serde(default)]
    pub tables: Vec<TableManifestEntry>,
    #[serde(default)]
    pub foreign_key_order: Vec<String>,
    #[serde(default)]
    pub discovered_at: String,
}

impl BundleManifest {
    pub fn table(&self, name: &str) -> Option<&TableManifestEntry> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// One clinic's rows at a point in time. Unknown top-level keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub manifest: BundleManifest,
    pub data: BTreeMap<String, Vec<Value>>,
}

impl SnapshotBundle {
    pub fn total_records(&self) -> u64 {
        self.data.values().map(|rows| rows.len() as u64).sum()
    }

    /// Tables in insert order: the manifest order first, then anything the
    /// manifest does not mention, alphabetically.
    pub fn table_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .manifest
            .foreign_key_order
            .iter()
            .filter(|t| self.data.contains_key(*t))
            .cloned()
            .collect();
        for table in self.data.keys() {
            if !order.contains(table) {
                order.push(table.clone());
            }
        }
        order
    }

    /// Recompute counts and checksums from `data`, in place.
    pub fn refresh_integrity(&mut self) {
        self.metadata.record_counts = self
            .data
            .iter()
            .map(|(table, rows)| (table.clone(), rows.len() as u64))
            .collect();
        self.metadata.checksums = compute_checksums(&self.data);
        for entry in &mut self.manifest.tables {
            if let Some(rows) = self.data.get(&entry.name) {
                entry.record_count = rows.len() as u64;
            }
            if let Some(hash) = self.metadata.checksums.per_table.get(&entry.name) {
                entry.checksum = hash.clone();
            }
        }
    }
}
