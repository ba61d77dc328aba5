//! Log output setup.
//!
//! `RUST_LOG` wins when it is set and parses; otherwise the configured
//! `log.level` applies to every target.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. Only the first call takes
/// effect.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Unknown names fall back to `info`.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => "off",
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
