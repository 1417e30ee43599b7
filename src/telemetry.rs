use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Safe to call once per
/// process; tests that need logging call this too, so it tolerates being
/// invoked more than once within a process (the second call is a no-op).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
