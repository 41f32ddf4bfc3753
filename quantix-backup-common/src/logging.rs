//! Logging initialization using tracing.

use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one timestamped line per event
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation
    Json,
}

impl LogFormat {
    /// Initialize the global subscriber in this format.
    pub fn init(self, level: &str) -> Result<()> {
        match self {
            Self::Pretty => init_logging(level),
            Self::Json => init_logging_json(level),
        }
    }
}

/// Build the level filter, letting `RUST_LOG` take precedence.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// Every line carries a local RFC 3339 timestamp so a backup run can be
/// reconstructed from the journal afterwards.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for hosts that ship the journal to a log aggregator.
pub fn init_logging_json(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .json()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_pretty() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_is_an_error() {
        // Whichever test initializes first wins; the second call must not panic.
        let _ = init_logging("debug");
        assert!(init_logging_json("debug").is_err());
    }
}
