//! Logging setup
//!
//! One global `tracing` subscriber for the process. `RUST_LOG` wins over the
//! configured filter so field debugging does not need a config change.

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber; later calls are ignored
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
