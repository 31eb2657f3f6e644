//! Multi-destination delivery of one leased job.

use crate::auto_delete::AutoDeletePolicy;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{JobError, Result};
use crate::job::{
    add_std, Destination, DestinationOutcome, FailureReason, JobBody, JobRecord, JobState,
    LeaseToken, MessageHandle,
};
use crate::rate_limit::{Permit, RateLimiter};
use crate::store::{JobStore, OutcomeDelta};
use crate::transport::{DeleteOutcome, SendOutcome, Transport};
use futures_util::future::join_all;
use herald_extras::retry::BackoffPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::Instrument;

/// What one transport call amounted to, independent of send/delete.
enum Attempt {
    Done(MessageHandle),
    Retry {
        wait: Option<Duration>,
        error: String,
    },
    Fail(FailureReason),
}

/// Delivers leased jobs through a [`Transport`].
///
/// Concurrency is bounded by one semaphore shared by every job this
/// dispatcher processes.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    transport_timeout: Duration,
    auto_delete: AutoDeletePolicy,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        wake: Arc<Notify>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            clock,
            permits: Arc::new(Semaphore::new(config.dispatch_concurrency)),
            backoff: config.backoff(),
            transport_timeout: config.transport_timeout(),
            auto_delete: AutoDeletePolicy::new(),
            wake,
        }
    }

    /// Transport calls that may start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Attempt every ready destination of a job returned by
    /// [`JobStore::lease`], then release that lease. Returns the settled
    /// record.
    pub async fn process(&self, job: JobRecord) -> Result<JobRecord> {
        let lease = job.lease_token().ok_or(JobError::LeaseLost(job.id))?;
        let span = tracing::info_span!("dispatch", job_id = %job.id, kind = %job.kind());
        self.process_inner(job, lease).instrument(span).await
    }

    async fn process_inner(&self, job: JobRecord, lease: LeaseToken) -> Result<JobRecord> {
        let started = self.clock.now();
        let targets = job.ready_destinations(started);
        tracing::debug!(
            destinations = targets.len(),
            dispatch = job.dispatch_count,
            "dispatching"
        );

        let results = join_all(
            targets
                .into_iter()
                .map(|destination| self.attempt(&job, destination, &lease)),
        )
        .await;

        for result in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_contention() => {
                    tracing::warn!(error = %e, "lost lease during dispatch");
                    return Err(e);
                }
                Err(e) => tracing::error!(error = %e, "failed to record destination outcome"),
            }
        }

        let settled = self.store.release(&job.id, &lease, self.clock.now()).await?;
        self.wake.notify_one();

        match settled.state {
            JobState::Delivered => tracing::info!(destinations = settled.outcomes.len(), "job delivered"),
            JobState::Failed => tracing::warn!(destinations = settled.outcomes.len(), "job failed on every destination"),
            JobState::Cancelled => tracing::info!("job cancelled during dispatch"),
            JobState::PartiallyDelivered if settled.partial_success => tracing::warn!(
                delivered = settled.delivered_count(),
                failed = settled.failed_count(),
                "job finished with partial success"
            ),
            _ => tracing::debug!(
                state = %settled.state,
                next_attempt_at = ?settled.next_attempt_at(),
                "job released with pending retries"
            ),
        }
        Ok(settled)
    }

    async fn attempt(
        &self,
        job: &JobRecord,
        destination: Destination,
        lease: &LeaseToken,
    ) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| JobError::BackendError("dispatcher semaphore closed".to_string()))?;

        let attempts = job
            .outcome(&destination)
            .map(DestinationOutcome::attempts)
            .unwrap_or(0);

        if let Permit::Denied { resume_at } = self.limiter.acquire(&destination) {
            tracing::debug!(destination = %destination, %resume_at, "rate limited, rescheduling");
            let outcome = DestinationOutcome::RetryScheduled {
                next_attempt_at: resume_at,
                attempts,
                last_error: Some("rate limited".to_string()),
            };
            return self
                .record(job, lease, OutcomeDelta::new(destination, outcome))
                .await;
        }

        let result = match &job.body {
            JobBody::Publish { payload, .. } => {
                match tokio::time::timeout(
                    self.transport_timeout,
                    self.transport.send(&destination, payload),
                )
                .await
                {
                    Ok(outcome) => self.classify_send(&destination, outcome),
                    Err(_) => Attempt::Retry {
                        wait: None,
                        error: "transport call timed out".to_string(),
                    },
                }
            }
            JobBody::Delete { handles, .. } => match handles.get(&destination) {
                Some(handle) => {
                    match tokio::time::timeout(
                        self.transport_timeout,
                        self.transport.delete(&destination, handle),
                    )
                    .await
                    {
                        Ok(outcome) => self.classify_delete(&destination, handle, outcome),
                        Err(_) => Attempt::Retry {
                            wait: None,
                            error: "transport call timed out".to_string(),
                        },
                    }
                }
                None => Attempt::Fail(FailureReason::Rejected(
                    "no message handle for destination".to_string(),
                )),
            },
        };

        let attempts = attempts + 1;
        let now = self.clock.now();
        let mut follow_up = None;

        let outcome = match result {
            Attempt::Done(handle) => {
                follow_up = self.auto_delete.follow_up(job, &destination, &handle, now);
                tracing::info!(destination = %destination, attempts, "delivered");
                DestinationOutcome::Delivered {
                    handle,
                    delivered_at: now,
                    attempts,
                }
            }
            Attempt::Retry { wait, error } if attempts < job.max_attempts => {
                let wait = wait.unwrap_or_else(|| self.backoff.delay_for(attempts - 1));
                tracing::warn!(destination = %destination, attempts, error = %error, retry_in_ms = wait.as_millis() as u64, "attempt failed, will retry");
                DestinationOutcome::RetryScheduled {
                    next_attempt_at: add_std(now, wait),
                    attempts,
                    last_error: Some(error),
                }
            }
            Attempt::Retry { error, .. } => {
                tracing::warn!(destination = %destination, attempts, error = %error, "retries exhausted");
                DestinationOutcome::PermanentlyFailed {
                    reason: FailureReason::RetryExhausted,
                    attempts,
                }
            }
            Attempt::Fail(reason) => {
                tracing::warn!(destination = %destination, attempts, reason = %reason, "permanent failure");
                DestinationOutcome::PermanentlyFailed { reason, attempts }
            }
        };

        let delta = OutcomeDelta::new(destination, outcome).with_follow_up(follow_up);
        self.record(job, lease, delta).await
    }

    async fn record(&self, job: &JobRecord, lease: &LeaseToken, delta: OutcomeDelta) -> Result<()> {
        let spawned = delta.follow_up.as_ref().map(|f| (f.id, f.due_at));
        self.store
            .update(&job.id, lease, delta, self.clock.now())
            .await?;
        if let Some((id, due_at)) = spawned {
            tracing::debug!(follow_up = %id, %due_at, "scheduled auto-delete");
        }
        Ok(())
    }

    fn classify_send(&self, destination: &Destination, outcome: SendOutcome) -> Attempt {
        match outcome {
            SendOutcome::Delivered(handle) => Attempt::Done(handle),
            SendOutcome::Throttled(wait) => {
                self.limiter.report_external_wait(destination, wait);
                Attempt::Retry {
                    wait: Some(wait),
                    error: format!("throttled for {}ms", wait.as_millis()),
                }
            }
            SendOutcome::Unavailable(error) => Attempt::Retry { wait: None, error },
            SendOutcome::PermanentFailure(reason) => Attempt::Fail(reason),
        }
    }

    fn classify_delete(
        &self,
        destination: &Destination,
        handle: &MessageHandle,
        outcome: DeleteOutcome,
    ) -> Attempt {
        match outcome {
            DeleteOutcome::Deleted | DeleteOutcome::AlreadyGone => Attempt::Done(handle.clone()),
            DeleteOutcome::Throttled(wait) => {
                self.limiter.report_external_wait(destination, wait);
                Attempt::Retry {
                    wait: Some(wait),
                    error: format!("throttled for {}ms", wait.as_millis()),
                }
            }
            DeleteOutcome::Unavailable(error) => Attempt::Retry { wait: None, error },
            DeleteOutcome::PermanentFailure(reason) => Attempt::Fail(reason),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available_permits", &self.permits.available_permits())
            .field("transport_timeout", &self.transport_timeout)
            .field("backoff", &self.backoff)
            .finish()
    }
}
