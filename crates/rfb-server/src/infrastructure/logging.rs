//! Structured logging set-up.
//!
//! All diagnostics go through `tracing` macros.  The embedding process calls
//! [`init_tracing`] once at start-up; the level comes from `RUST_LOG` when
//! set, otherwise from the configured default (usually `server.log_level`).

use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` if present and valid, else `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global fmt subscriber.
///
/// Returns `false` if a global subscriber was already installed, which
/// happens when several tests share one process.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .try_init()
        .is_ok()
}
