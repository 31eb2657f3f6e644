use crate::error::Result;
use crate::job::{
    Destination, DestinationOutcome, JobId, JobKind, JobRecord, JobState, LeaseToken,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

mod table;

pub mod file;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub mod postgres;

pub(crate) use table::JobTable;

/// One destination's new outcome, written by the lease holder.
///
/// A delivery that schedules a follow-up delete job carries it here so the
/// outcome and the new job are persisted together.
#[derive(Debug, Clone)]
pub struct OutcomeDelta {
    pub destination: Destination,
    pub outcome: DestinationOutcome,
    pub follow_up: Option<JobRecord>,
}

impl OutcomeDelta {
    pub fn new(destination: Destination, outcome: DestinationOutcome) -> Self {
        Self {
            destination,
            outcome,
            follow_up: None,
        }
    }

    pub fn with_follow_up(mut self, job: Option<JobRecord>) -> Self {
        self.follow_up = job;
        self
    }
}

/// Selection criteria for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub states: Vec<JobState>,
    pub kind: Option<JobKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Add an accepted state. No states means any state.
    pub fn state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(owner) = &self.owner {
            if job.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if let Some(kind) = self.kind {
            if job.kind() != kind {
                return false;
            }
        }
        true
    }
}

/// Durable storage for job records.
///
/// Every mutation is atomic per job. `now` is supplied by the caller so all
/// time decisions come from one clock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with `AlreadyExists` if the id is taken.
    async fn submit(&self, job: JobRecord) -> Result<JobId>;

    /// Snapshot of a job.
    async fn get(&self, id: &JobId) -> Result<JobRecord>;

    /// Ids of jobs with work due at or before `at`, earliest first.
    ///
    /// Jobs whose lease is still held are excluded; jobs whose lease has
    /// expired are included.
    async fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Earliest wake time across all non-terminal jobs.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Claim a job for `owner` until `now + ttl`.
    ///
    /// The returned record carries the new [`LeaseToken`] in `lease.token`;
    /// `update` and `release` only accept that token.
    async fn lease(
        &self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Record a destination outcome, and its follow-up job if any, in one
    /// atomic write. Only the holder of the current lease may call this.
    async fn update(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        delta: OutcomeDelta,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Drop the lease and settle the aggregate state.
    async fn release(&self, id: &JobId, lease: &LeaseToken, now: DateTime<Utc>)
        -> Result<JobRecord>;

    /// Cancel a job that has not reached a terminal state.
    async fn cancel(
        &self,
        id: &JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Jobs matching `filter`, ordered by due time.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Delete a terminal job whose follow-ups are terminal too.
    async fn remove(&self, id: &JobId) -> Result<()>;

    /// Remove removable jobs that finished before `before`. Returns the count.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

pub(crate) fn lease_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}
