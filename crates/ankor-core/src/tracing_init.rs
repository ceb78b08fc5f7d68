//! Shared tracing/logging initialization.
//!
//! The CLI and any future long-running surface use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON
//! output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"ankor=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let base = tracing_subscriber::registry().with(filter);
    let fmt = tracing_subscriber::fmt::layer();
    if log_json {
        base.with(fmt.json()).init();
    } else {
        base.with(fmt).init();
    }
}
