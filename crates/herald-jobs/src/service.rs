//! Job submission API.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{JobError, Result};
use crate::job::{add_std, Destination, JobId, JobRecord, Payload};
use crate::store::{JobFilter, JobStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Per-submission options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Transport calls allowed per destination; engine default if unset.
    pub max_attempts: Option<u32>,
    /// Delete each delivered message this long after its delivery.
    pub auto_delete_after: Option<Duration>,
    /// Submitting user, for listing and cleanup.
    pub owner: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn auto_delete_after(mut self, delay: Duration) -> Self {
        self.auto_delete_after = Some(delay);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Entry point for submitting, inspecting and cancelling jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
    default_max_attempts: u32,
    max_attempts_limit: u32,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        wake: Arc<Notify>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            wake,
            default_max_attempts: config.default_max_attempts,
            max_attempts_limit: config.max_attempts_limit,
        }
    }

    /// Schedule `payload` for delivery to `destinations` at `due_at`.
    ///
    /// A `due_at` in the past makes the job due immediately. Submitting the
    /// same content twice creates two independent jobs.
    pub async fn schedule_publish<I, D>(
        &self,
        payload: impl Into<Payload>,
        destinations: I,
        due_at: DateTime<Utc>,
        options: PublishOptions,
    ) -> Result<JobId>
    where
        I: IntoIterator<Item = D>,
        D: Into<Destination>,
    {
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts > self.max_attempts_limit {
            return Err(JobError::InvalidJob(format!(
                "max_attempts {} exceeds the limit of {}",
                max_attempts, self.max_attempts_limit
            )));
        }

        let job = JobRecord::publish(
            payload.into(),
            destinations.into_iter().map(Into::into),
            due_at,
            max_attempts,
            options.auto_delete_after,
            self.clock.now(),
        )?
        .with_owner(options.owner);

        let destinations = job.outcomes.len();
        let id = self.store.submit(job).await?;
        tracing::info!(job_id = %id, %due_at, destinations, "publish scheduled");

        self.wake.notify_one();
        Ok(id)
    }

    /// Schedule for immediate delivery.
    pub async fn publish_now<I, D>(
        &self,
        payload: impl Into<Payload>,
        destinations: I,
        options: PublishOptions,
    ) -> Result<JobId>
    where
        I: IntoIterator<Item = D>,
        D: Into<Destination>,
    {
        let now = self.clock.now();
        self.schedule_publish(payload, destinations, now, options)
            .await
    }

    /// Schedule for delivery after `delay`.
    pub async fn publish_in<I, D>(
        &self,
        payload: impl Into<Payload>,
        destinations: I,
        delay: Duration,
        options: PublishOptions,
    ) -> Result<JobId>
    where
        I: IntoIterator<Item = D>,
        D: Into<Destination>,
    {
        let due_at = add_std(self.clock.now(), delay);
        self.schedule_publish(payload, destinations, due_at, options)
            .await
    }

    /// Cancel a job. Destinations already delivered stay delivered.
    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord> {
        self.cancel_with_reason(id, None).await
    }

    pub async fn cancel_with_reason(&self, id: &JobId, reason: Option<String>) -> Result<JobRecord> {
        let job = self.store.cancel(id, reason, self.clock.now()).await?;
        if job.cancel_requested && !job.is_terminal() {
            tracing::info!(job_id = %id, "cancellation requested for job in flight");
        } else {
            tracing::info!(job_id = %id, "job cancelled");
        }
        Ok(job)
    }

    /// Snapshot of a job and its per-destination outcomes.
    pub async fn get_status(&self, id: &JobId) -> Result<JobRecord> {
        self.store.get(id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.store.list(filter).await
    }

    /// All jobs submitted by `owner`.
    pub async fn jobs_for_owner(&self, owner: &str) -> Result<Vec<JobRecord>> {
        self.store.list(&JobFilter::new().owner(owner)).await
    }

    /// Remove terminal jobs that finished more than `older_than` ago.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| JobError::InvalidJob(e.to_string()))?;
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = self.store.purge_finished(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, %cutoff, "purged finished jobs");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("default_max_attempts", &self.default_max_attempts)
            .field("max_attempts_limit", &self.max_attempts_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{JobState, JobKind};
    use crate::store::memory::InMemoryStore;
    use serde_json::json;

    fn service() -> (JobService, ManualClock) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let service = JobService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(clock.clone()),
            Arc::new(Notify::new()),
            &EngineConfig::default(),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn schedule_uses_default_attempts() {
        let (service, clock) = service();
        let due = clock.now() + chrono::Duration::minutes(10);

        let id = service
            .schedule_publish(json!({"text": "hi"}), ["@a", "@b"], due, PublishOptions::new())
            .await
            .unwrap();

        let job = service.get_status(&id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.kind(), JobKind::Publish);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.due_at, due);
        assert_eq!(job.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let (service, _) = service();

        let empty: Vec<&str> = Vec::new();
        assert!(matches!(
            service.publish_now(json!({}), empty, PublishOptions::new()).await,
            Err(JobError::InvalidJob(_))
        ));
        assert!(matches!(
            service
                .publish_now(json!({}), ["@a"], PublishOptions::new().max_attempts(0))
                .await,
            Err(JobError::InvalidJob(_))
        ));
        assert!(matches!(
            service
                .publish_now(json!({}), ["@a"], PublishOptions::new().max_attempts(11))
                .await,
            Err(JobError::InvalidJob(_))
        ));
        assert!(matches!(
            service
                .publish_now(
                    json!({}),
                    ["@a"],
                    PublishOptions::new().auto_delete_after(Duration::ZERO)
                )
                .await,
            Err(JobError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn cancel_twice_reports_terminal() {
        let (service, _) = service();
        let id = service
            .publish_in(json!({}), ["@a"], Duration::from_secs(600), PublishOptions::new())
            .await
            .unwrap();

        let job = service.cancel(&id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(matches!(
            service.cancel(&id).await,
            Err(JobError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            service.cancel(&JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_respects_age() {
        let (service, clock) = service();
        let id = service
            .publish_now(json!({}), ["@a"], PublishOptions::new().owner("9"))
            .await
            .unwrap();
        service.cancel(&id).await.unwrap();

        assert_eq!(service.purge_finished(Duration::from_secs(3600)).await.unwrap(), 0);

        clock.advance(Duration::from_secs(3601));
        assert_eq!(service.purge_finished(Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(service.jobs_for_owner("9").await.unwrap().is_empty());
    }
}
