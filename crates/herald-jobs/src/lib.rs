//! Scheduled multi-destination publishing.
//!
//! Jobs are durable records in a [`JobStore`]. A [`Scheduler`] loop leases
//! due jobs and a [`Dispatcher`] delivers them to every destination through
//! a [`Transport`], under a [`RateLimiter`], recording one outcome per
//! destination. Publish jobs with an auto-delete delay spawn follow-up
//! delete jobs as each destination is delivered.

pub mod auto_delete;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod rate_limit;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

pub use auto_delete::AutoDeletePolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineHandle};
pub use error::{JobError, Result};
pub use job::{
    Destination, DestinationOutcome, FailureReason, JobBody, JobId, JobKind, JobRecord, JobState,
    Lease, LeaseToken, MessageHandle, Payload,
};
pub use rate_limit::{BucketConfig, Permit, RateLimiter};
pub use scheduler::Scheduler;
pub use service::{JobService, PublishOptions};
pub use store::file::FileStore;
pub use store::memory::InMemoryStore;
pub use store::{JobFilter, JobStore, OutcomeDelta};
pub use transport::{DeleteOutcome, SendOutcome, Transport};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;

#[cfg(feature = "redis")]
pub use store::redis::RedisStore;
