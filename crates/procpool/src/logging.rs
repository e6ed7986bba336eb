//! Logging setup

use tracing::Level;

use crate::config::PoolConfig;

/// Parse a configured log level, falling back to `INFO`
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global fmt subscriber at the configured level
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(config: &PoolConfig) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(&config.log_level))
        .with_target(false)
        .try_init()
        .is_ok()
}
