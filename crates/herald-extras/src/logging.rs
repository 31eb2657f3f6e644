//! Tracing subscriber setup.
//!
//! The engine itself only emits `tracing` events; binaries and tests call
//! [`init_tracing`] once to install a subscriber.
//!
//! # Example
//!
//! ```rust,no_run
//! use herald_extras::logging::{init_tracing, LogFormat, LoggingConfig};
//!
//! init_tracing(&LoggingConfig::default().format(LogFormat::Json));
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact format (one line per event)
    #[default]
    Compact,
    /// Multi-line, human-readable output for development
    Pretty,
    /// JSON lines (structured logging)
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Whether to include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            default_filter: "info,herald=debug,herald_jobs=debug".to_string(),
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Set the output format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the fallback filter directive
    pub fn default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Toggle the event target in output
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// The filter that will be installed: `RUST_LOG` if valid, else the fallback.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install a global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed (for example by a
/// test harness); the existing one is kept.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = config.env_filter();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("Compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = LoggingConfig::default()
            .format(LogFormat::Pretty)
            .default_filter("warn")
            .with_target(false);

        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.default_filter, "warn");
        assert!(!config.with_target);
    }

    #[test]
    fn second_init_keeps_existing_subscriber() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
