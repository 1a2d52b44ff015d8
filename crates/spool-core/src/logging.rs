//! Tracing/logging initialization.
//!
//! Filter from `RUST_LOG` (default `info`). Set `SPOOL_LOG_FORMAT=json` for
//! JSON lines instead of the human-readable format.

use tracing_subscriber::EnvFilter;

const FORMAT_VAR: &str = "SPOOL_LOG_FORMAT";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let _ = if json_requested(std::env::var(FORMAT_VAR).ok().as_deref()) {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|format| format.trim().eq_ignore_ascii_case("json"))
}
