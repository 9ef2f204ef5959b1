//! Subscriber setup for binaries and tests.
//!
//! The library only emits `tracing` events; callers install a subscriber once with
//! [`init_logging`]. `RUST_LOG` overrides the default filter.

use tracing_subscriber::EnvFilter;

use crate::too_errors::TooError;

/// Default filter, `verbose` raises the crate to `debug`.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,too=debug"
    } else {
        "warn,too=info"
    }
}

/// Install a global fmt subscriber writing to stderr.
///
/// Return
/// ----------
/// * `Err(TooError::LoggingInit)` if a global subscriber is already set.
pub fn init_logging(verbose: bool) -> Result<(), TooError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| TooError::LoggingInit(e.to_string()))
}
