//! # herald-extras
//!
//! Ambient utilities shared by the Herald crates.
//!
//! Everything here is opt-in via Cargo feature flags:
//!
//! - `config` - Typed configuration from environment variables and `.env` files
//! - `logging` - `tracing-subscriber` initialisation with selectable output formats
//! - `retry` - Backoff policies for transient delivery failures
//! - `full` - All features enabled
//!
//! ## Example
//!
//! ```toml
//! [dependencies]
//! herald-extras = { version = "0.1", features = ["config", "logging"] }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Configuration management module
#[cfg(feature = "config")]
pub mod config;

// Tracing subscriber setup
#[cfg(feature = "logging")]
pub mod logging;

// Backoff policies
#[cfg(feature = "retry")]
pub mod retry;

#[cfg(feature = "config")]
pub use config::{env_var, load_dotenv, Config, ConfigError, Environment};

#[cfg(feature = "logging")]
pub use logging::{init_tracing, LogFormat, LoggingConfig};

#[cfg(feature = "retry")]
pub use retry::{BackoffPolicy, RetryStrategy};
