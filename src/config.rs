use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BUCKET: &str = "clinic-snapshots";
const DEFAULT_MAX_BUNDLE_BYTES: u64 = 100 * 1024 * 1024;
const HARD_MAX_BUNDLE_BYTES: u64 = 1024 * 1024 * 1024;
const MIN_BUNDLE_BYTES: u64 = 64 * 1024;
const DEFAULT_MAX_PER_CLINIC: usize = 30;
const HARD_MAX_PER_CLINIC: usize = 365;
const DEFAULT_RETENTION_DAYS: i64 = 30;
const HARD_MAX_RETENTION_DAYS: i64 = 3650;
const DEFAULT_CHUNK_SIZE: usize = 500;
const HARD_MAX_CHUNK_SIZE: usize = 10_000;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CACHE_CLEANUP: Duration = Duration::from_secs(5 * 60);
const HARD_MAX_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Runtime knobs for the snapshot engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    pub storage_root: PathBuf,
    pub bucket: String,
    pub max_bundle_bytes: u64,
    pub max_snapshots_per_clinic: usize,
    pub retention_days: i64,
    pub insert_chunk_size: usize,
    pub lookup_chunk_size: usize,
    pub cache_ttl: Duration,
    pub cache_cleanup_interval: Duration,
    pub enforce_roles: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(env::temp_dir);
        Self {
            storage_root: base.join("clinic-snapshot"),
            bucket: DEFAULT_BUCKET.to_string(),
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
            max_snapshots_per_clinic: DEFAULT_MAX_PER_CLINIC,
            retention_days: DEFAULT_RETENTION_DAYS,
            insert_chunk_size: DEFAULT_CHUNK_SIZE,
            lookup_chunk_size: DEFAULT_CHUNK_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_cleanup_interval: DEFAULT_CACHE_CLEANUP,
            enforce_roles: false,
        }
    }
}

impl SnapshotConfig {
    /// Defaults overlaid with `CLINIC_SNAPSHOT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("CLINIC_SNAPSHOT_STORAGE_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            config.storage_root = PathBuf::from(dir);
        }

        config.max_bundle_bytes = lookup("CLINIC_SNAPSHOT_MAX_BYTES")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.clamp(MIN_BUNDLE_BYTES, HARD_MAX_BUNDLE_BYTES))
            .unwrap_or(DEFAULT_MAX_BUNDLE_BYTES);

        config.max_snapshots_per_clinic = lookup("CLINIC_SNAPSHOT_MAX_PER_CLINIC")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_PER_CLINIC))
            .unwrap_or(DEFAULT_MAX_PER_CLINIC);

        config.retention_days = lookup("CLINIC_SNAPSHOT_RETENTION_DAYS")
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_RETENTION_DAYS))
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        let chunk = lookup("CLINIC_SNAPSHOT_CHUNK_SIZE")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_CHUNK_SIZE))
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        config.insert_chunk_size = chunk;
        config.lookup_chunk_size = chunk;

        config.cache_ttl = lookup("CLINIC_SNAPSHOT_CACHE_TTL_SECS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(|value| Duration::from_secs(value.min(HARD_MAX_CACHE_TTL_SECS)))
            .unwrap_or(DEFAULT_CACHE_TTL);

        config.enforce_roles = lookup("CLINIC_SNAPSHOT_ENFORCE_ROLES")
            .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        config
    }

    /// Directory the filesystem store writes objects under.
    pub fn bucket_dir(&self) -> PathBuf {
        self.storage_root.join(&self.bucket)
    }
}
