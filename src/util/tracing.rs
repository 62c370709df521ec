//! Tracing helpers

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{EnvFilter, prelude::*};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Environment variable that controls what gets logged
const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Computes the trace level for the daemon's verbosity flags
pub(crate) fn trace_level(debug: bool, quiet: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    }
}

/// Result type for `filter_for()`
struct FilterResult {
    filter: EnvFilter,
    used_env: bool, // Did we use the environment variable?
}

/// Log filter setup:
/// Use `RUST_LOG` if it was present; if not, log only sluice items at the
/// given trace level.
fn filter_for(trace_level: &str) -> anyhow::Result<FilterResult> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR)
        .map(|filter| FilterResult {
            filter,
            used_env: true,
        })
        .or_else(|e| {
            // The env var was unset or invalid. Which is it?
            if std::env::var(STANDARD_ENV_VAR).is_ok() {
                anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was not understood: {e}");
            }
            // It was unset. Fall back.
            Ok(FilterResult {
                filter: EnvFilter::try_new(format!("sluice={trace_level}"))?,
                used_env: false,
            })
        })
}

/// Set up rust tracing to stderr.
///
/// By default we log only our events (sluice), at a given trace level.
/// This can be overridden by setting `RUST_LOG`.
///
/// **NOTE:** You can only run this once per process. A global bool prevents
/// re-running.
pub(crate) fn setup(trace_level: &str) -> anyhow::Result<()> {
    if is_initialized() {
        tracing::warn!("tracing::setup called a second time (ignoring)");
        return Ok(());
    }
    TRACING_INITIALIZED.store(true, Ordering::Relaxed);

    let filter = filter_for(trace_level)?;
    // If we used the environment variable, show log targets; if we did
    // not, we're only logging sluice, so do not show them.
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(filter.used_env)
        .with_writer(std::io::stderr)
        .with_filter(filter.filter);
    tracing_subscriber::registry().with(layer).init();

    Ok(())
}

/// Returns whether tracing has been initialized
pub(crate) fn is_initialized() -> bool {
    TRACING_INITIALIZED.load(Ordering::Relaxed)
}
