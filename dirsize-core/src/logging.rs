//! Logging configuration, driven by `ENABLE_LOGS` instead of `RUST_LOG`.

use tracing_subscriber::fmt;

use crate::config::LogLevel;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Off,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Initializes the global subscriber. A level of `Off` installs a
    /// filter that discards every event rather than skipping init, so
    /// downstream code can still build spans without panicking.
    pub fn init(&self) -> Result<(), Box<dyn std::error::Error>> {
        let filter = self.level.as_filter_str();
        let builder = fmt().with_target(true).with_level(true).with_ansi(false);

        if self.json_format {
            let _ = builder.json().with_env_filter(filter).try_init();
        } else {
            let _ = builder.with_env_filter(filter).try_init();
        }

        tracing::info!("logging initialized - level: {}", filter);
        Ok(())
    }

    pub fn init_from_env() -> Result<(), Box<dyn std::error::Error>> {
        let level = std::env::var("ENABLE_LOGS")
            .map(|v| parse_level(&v))
            .unwrap_or(LogLevel::Off);
        Self {
            level,
            json_format: false,
        }
        .init()
    }
}

fn parse_level(v: &str) -> LogLevel {
    match v.to_ascii_lowercase().as_str() {
        "info" => LogLevel::Info,
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Off,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_off() {
        let config = LoggingConfig::default();
        assert_eq!(config.level.as_filter_str(), "off");
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("DEBUG").as_filter_str(), "debug");
        assert_eq!(parse_level("bogus").as_filter_str(), "off");
    }
}
