use tracing_subscriber::fmt::time::UtcTime;

const LOG_ENV: &str = "CLINIC_SNAPSHOT_LOG";
const DEFAULT_FILTER: &str = "clinic_snapshot=info,sqlx=warn";

/// Filter directive in effect: `CLINIC_SNAPSHOT_LOG`, then `RUST_LOG`, then
/// the built-in default.
pub fn filter_directive() -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the JSON subscriber and the `log` bridge. Safe to call twice; the
/// second call is a no-op.
pub fn init() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_directive())
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .finish();
    // `finish` skips the bridge that `try_init` would install.
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = tracing_log::LogTracer::init();
    }
}
