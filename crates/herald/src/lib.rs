//! # Herald
//!
//! A scheduled multi-destination publication engine.
//!
//! Submit a payload with a due time and a set of destinations; Herald keeps
//! the job in a durable store, leases it when due, delivers to every
//! destination through your [`Transport`] under per-destination and global
//! rate limits, retries transient failures with backoff, and can delete the
//! delivered messages again after a delay.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use herald::prelude::*;
//!
//! struct Console;
//!
//! #[async_trait]
//! impl Transport for Console {
//!     async fn send(&self, destination: &Destination, payload: &Payload) -> SendOutcome {
//!         println!("{} <- {}", destination, payload.as_value());
//!         SendOutcome::Delivered(MessageHandle::new("1"))
//!     }
//!
//!     async fn delete(&self, _: &Destination, _: &MessageHandle) -> DeleteOutcome {
//!         DeleteOutcome::Deleted
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), HeraldError> {
//!     let engine = Herald::from_env()?.build(Console)?;
//!     let handle = engine.spawn();
//!
//!     engine
//!         .service()
//!         .publish_in(json!({"text": "hi"}), ["@news"], Duration::from_secs(60), PublishOptions::new())
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `postgres` - [`PostgresStore`] backed by `sqlx`
//! - `redis` - [`RedisStore`] using optimistic transactions
//! - `full` - All optional features enabled

mod builder;

pub use builder::{Herald, HeraldError, StoreChoice, ENV_PREFIX};

// Re-export the engine
pub use herald_jobs::*;

// Re-export ambient helpers
pub use herald_extras::config as env_config;
pub use herald_extras::logging;
pub use herald_extras::retry;
pub use herald_extras::{Environment, LogFormat, LoggingConfig};

// Re-export commonly used crates
pub use async_trait;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

/// Prelude module - import everything you need with `use herald::prelude::*`
pub mod prelude {
    pub use crate::{Herald, HeraldError};

    pub use herald_jobs::{
        // Submission
        Engine,
        EngineConfig,
        EngineHandle,
        JobService,
        PublishOptions,
        // Model
        Destination,
        DestinationOutcome,
        FailureReason,
        JobId,
        JobKind,
        JobRecord,
        JobState,
        MessageHandle,
        Payload,
        // Stores
        FileStore,
        InMemoryStore,
        JobFilter,
        JobStore,
        // Transport
        DeleteOutcome,
        SendOutcome,
        Transport,
        // Errors
        JobError,
    };

    pub use herald_extras::{LogFormat, LoggingConfig};

    pub use async_trait::async_trait;
    pub use serde_json::json;
    pub use std::time::Duration;
}
