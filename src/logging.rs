//! Structured logging setup for the daemon and CLI.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level; `format` selects json or plain text output. Safe to call twice
/// (the second call is a no-op), which keeps tests simple.
pub fn init(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format.eq_ignore_ascii_case("text") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    }
}
