//! Structured JSON logging via `tracing-subscriber`.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the given
//! default directive. Allocation spans carry `company_id`, `payment_id` and
//! the allocated total, so JSON output is what operators grep.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber with an `info` default.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default(DEFAULT_DIRECTIVE);
}

/// Install the global subscriber, falling back to `directive` when `RUST_LOG`
/// is unset or unparsable.
pub fn init_with_default(directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(directive, "logging initialized");
    }
}
