use tracing_subscriber::EnvFilter;

/// Installs the process-wide subscriber. `log` records from every module
/// (and from sqlx) are bridged into it. Safe to call more than once.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
