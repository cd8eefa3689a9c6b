//! Shared logging bootstrap for roomshard binaries.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }

    /// `LOG_FORMAT`, defaulting to JSON
    pub fn from_env() -> Result<Self> {
        match std::env::var("LOG_FORMAT") {
            Err(_) => Ok(LogFormat::Json),
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "json" | "" => Ok(LogFormat::Json),
                "pretty" | "text" => Ok(LogFormat::Pretty),
                other => Err(Error::Config(format!(
                    "invalid LOG_FORMAT '{other}', expected json or pretty"
                ))),
            },
        }
    }
}

/// Install the global subscriber for a binary.
///
/// `RUST_LOG`, when set, takes precedence over `log_level`.
pub fn init_logging(service_name: &str, log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;
    let format = LogFormat::from_env()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed
        .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

    info!(
        service.name = service_name,
        log.format = format.as_str(),
        "Logging initialized"
    );
    Ok(())
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_mixed_case() {
        assert_eq!(parse_log_level(" Warn ").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
    }

    #[test]
    fn parse_log_level_rejects_unknown() {
        let err = parse_log_level("verbose").unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }
}
