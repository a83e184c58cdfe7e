//! Tracing setup: one global subscriber initialized once from `main`,
//! matching the teacher's `infrastructure/logging::LoggerImpl` but without
//! the file-rotation/audit-trail machinery this crate has no use for.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Initializes the global `tracing` subscriber. Must be called exactly once,
/// as early as possible in `main`.
///
/// # Errors
/// Returns an error if `config.level` doesn't parse as a `tracing::Level`.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let default_level = parse_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .init();
        }
    }

    tracing::info!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_known_names() {
        assert!(matches!(parse_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_level("INFO"), Ok(Level::INFO)));
        assert!(parse_level("verbose").is_err());
    }
}
