//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber once. Respects `RUST_LOG`; defaults
/// to `info` for this crate and `warn` for everything else.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "warn,wordstat_sessions=debug"
    } else {
        "warn,wordstat_sessions=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
