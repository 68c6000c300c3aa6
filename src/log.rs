//! Logging bootstrap. Installs a `tracing-subscriber` formatter with a
//! banner line close to thttpd's traditional syslog-style startup message,
//! and respects `RUST_LOG` for per-module level overrides.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Initializes the global `tracing` subscriber. Safe to call once at
/// process startup; a second call is a no-op (the underlying
/// `set_global_default` error is swallowed since it only ever fires in
/// tests that initialize more than once).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Emits the startup banner thttpd prints once sockets are bound and the
/// server is about to drop into its accept loop.
pub fn startup_banner(version: &str, port_count: usize) {
    tracing::info!(version, port_count, "thttpd core starting");
}
