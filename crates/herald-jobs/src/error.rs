use crate::job::{Destination, JobId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Job {0} is leased by another worker")]
    AlreadyLeased(JobId),

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("Lease on job {0} is no longer held by this worker")]
    LeaseLost(JobId),

    #[error("Destination {destination} of job {job} already has a final outcome")]
    OutcomeRegression { job: JobId, destination: Destination },

    #[error("Job {job} has no destination {destination}")]
    UnknownDestination { job: JobId, destination: Destination },

    #[error("Job {0} cannot be removed while it or its follow-ups are unfinished")]
    NotRemovable(JobId),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl JobError {
    /// Another worker owns (or took over) the job.
    pub fn is_contention(&self) -> bool {
        matches!(self, JobError::AlreadyLeased(_) | JobError::LeaseLost(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
