//! Diagnostic tracing.
//!
//! Session transcripts are the product record and are always written; tracing
//! is for operators and follows `RUST_LOG`. Classifier decisions that were
//! allowed only by a heuristic are logged at `warn` under the `solver::audit`
//! target, so they stay visible with the default filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the stderr subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=solver=info,solver::audit=warn solver run challenges/warmup
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
