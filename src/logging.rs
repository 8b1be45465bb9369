//! Logging setup.
//!
//! The crate only emits `tracing` events; nothing is printed unless the host
//! installs a subscriber. Hosts without their own setup can call
//! [`init_logging`].

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable holding a filter directive, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CONSOLE_STATE_LOG";

/// Output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber installed.
    Silent,
    /// Compact stderr lines, `info` by default.
    Development,
    /// Pretty output with source locations, `debug` by default.
    Debug,
    /// One JSON object per event, `info` by default.
    Json,
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

/// Install a global subscriber for `mode`.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let result = match mode {
        LoggingMode::Silent => return Ok(()),
        LoggingMode::Development => Registry::default()
            .with(fmt::layer().with_target(false).compact())
            .with(env_filter("info"))
            .try_init(),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(env_filter("debug"))
            .try_init(),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(env_filter("info"))
            .try_init(),
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// Pick the mode from `CONSOLE_STATE_LOG_MODE` (`development`, `debug`,
/// `json`); anything else is silent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var("CONSOLE_STATE_LOG_MODE").as_deref() {
        Ok("development") => LoggingMode::Development,
        Ok("debug") => LoggingMode::Debug,
        Ok("json") => LoggingMode::Json,
        _ => LoggingMode::Silent,
    };
    init_logging(mode)
}

/// Filter from `CONSOLE_STATE_LOG`, then `RUST_LOG`, then `default_level`.
fn env_filter(default_level: &str) -> EnvFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        // Whichever test installs first wins; the other must report an error.
        let first = init_logging(LoggingMode::Json);
        let second = init_logging(LoggingMode::Development);
        assert!(first.is_err() || second.is_err());
    }
}
