//! Tracing setup for the router's stderr stream.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: the human-readable stderr stream, filtered
//!   via `RUST_LOG`. This carries both dev diagnostics and the log
//!   pipeline's formatted event lines.
//!
//! - **Structured logging (`io/log_pipeline`)**: JSONL product artifacts on
//!   disk. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset: the router's event stream
/// is operational output, not only debugging aid.
///
/// # Example
/// ```bash
/// RUST_LOG=router=debug router serve
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
