//! Operator diagnostics on stderr, filtered by `RUST_LOG`.
//!
//! Nothing here is a product artifact. Digests, heartbeat records, escalation
//! files and `events.jsonl` are written by `io/` whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber: compact lines on stderr, `info` unless
/// `RUST_LOG` says otherwise.
///
/// ```bash
/// RUST_LOG=foreman::io::inbox=debug foreman bridge --loop
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .init();
}
