//! Configuration loading from the environment.
//!
//! Herald reads its static configuration bundle once at startup. Values come
//! from process environment variables, optionally seeded from a `.env` file,
//! and are deserialized into a typed struct with [`Config<T>`].
//!
//! # Example
//!
//! ```ignore
//! use herald_extras::config::{load_dotenv, Config};
//! use serde::Deserialize;
//!
//! load_dotenv();
//!
//! #[derive(Deserialize)]
//! struct StoreSettings {
//!     store_path: String,
//!     lease_ttl_secs: u64,
//! }
//!
//! // Reads HERALD_STORE_PATH and HERALD_LEASE_TTL_SECS
//! let settings = Config::<StoreSettings>::from_env_prefixed("HERALD")?.into_inner();
//! ```

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Name of the variable selecting the [`Environment`] profile.
pub const ENVIRONMENT_VAR: &str = "HERALD_ENV";

/// Why configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was present but could not be deserialized.
    #[error("Configuration error: {0}")]
    EnvyError(#[source] envy::Error),

    /// A required variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    /// A value parsed but is not acceptable.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Build a [`ConfigError::Invalid`] for `field`.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<envy::Error> for ConfigError {
    fn from(err: envy::Error) -> Self {
        match err {
            envy::Error::MissingValue(var) => ConfigError::MissingVar(var.to_string()),
            other => ConfigError::EnvyError(other),
        }
    }
}

/// Deployment profile, detected from `HERALD_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// Local development: verbose logs, human-readable output.
    Development,
    /// Production deployment: info-level logs, machine-readable output.
    Production,
    /// Any other named deployment (staging, canary, ...).
    Custom(String),
}

impl Environment {
    /// Read `HERALD_ENV`. Unset means development; `prod` and `dev` are
    /// accepted as short forms.
    pub fn current() -> Self {
        match std::env::var(ENVIRONMENT_VAR) {
            Err(_) => Self::Development,
            Ok(name) => match name.trim().to_ascii_lowercase().as_str() {
                "production" | "prod" => Self::Production,
                "development" | "dev" | "" => Self::Development,
                other => Self::Custom(other.to_string()),
            },
        }
    }

    /// Whether this is the production profile.
    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }

    /// Profile name as written in `HERALD_ENV`.
    pub fn name(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Default `tracing` filter directive for this profile.
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Self::Development => "info,herald=debug,herald_jobs=debug",
            Self::Production | Self::Custom(_) => "info",
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed configuration deserialized from environment variables.
///
/// Field names map to SCREAMING_SNAKE_CASE variable names, so
/// `poll_interval_ms` reads `HERALD_POLL_INTERVAL_MS` with
/// [`Config::from_env_prefixed`]`("HERALD")`.
#[derive(Debug, Clone)]
pub struct Config<T>(pub T);

impl<T: DeserializeOwned> Config<T> {
    /// Load from variables starting with `{prefix}_`.
    pub fn from_env_prefixed(prefix: &str) -> Result<Self, ConfigError> {
        Ok(Config(envy::prefixed(format!("{}_", prefix)).from_env::<T>()?))
    }

    /// Load from explicit unprefixed key/value pairs.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(Config(envy::from_iter::<_, T>(pairs)?))
    }

    /// Unwrap the loaded settings.
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Seed the process environment from `.env` in the working directory.
///
/// A missing file is fine and variables already set are left alone.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env file"),
    }
}

/// Parse `name` if it is set. A set but malformed value is an error.
pub fn env_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        Err(_) => Ok(None),
    }
}
