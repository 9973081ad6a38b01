//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence when set. Otherwise the level comes from
//! `VORTEXL2_LOG_LEVEL` (default `info`). Color follows
//! `VORTEXL2_LOG_COLOR`, falling back to `NO_COLOR`/`TERM` detection.

use std::env;
use tracing::Level;

/// Logging settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            color: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let level = env::var("VORTEXL2_LOG_LEVEL")
            .ok()
            .and_then(|s| parse_level(&s))
            .unwrap_or(Level::INFO);

        let color = env::var("VORTEXL2_LOG_COLOR")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or_else(|_| env::var("NO_COLOR").is_err() && env::var("TERM").is_ok());

        Self { level, color }
    }
}

/// Parse a level name, accepting `warning` for `warn`
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Create a tracing subscriber from environment settings.
pub fn subscriber() -> impl tracing::Subscriber + Send + Sync {
    subscriber_with(&LogConfig::from_env())
}

/// Create a tracing subscriber from explicit settings.
pub fn subscriber_with(config: &LogConfig) -> impl tracing::Subscriber + Send + Sync + use<> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(config.color))
}

/// Install the subscriber globally.
///
/// Returns `false` when a global subscriber was already set.
pub fn init() -> bool {
    tracing::subscriber::set_global_default(subscriber()).is_ok()
}
