//! The due-time evaluation loop.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{JobError, Result};
use crate::job::JobId;
use crate::store::JobStore;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

/// Pause after a pass that found due jobs but could claim none of them.
const CONTENDED_BACKOFF: Duration = Duration::from_millis(50);

/// Removes a job from the in-flight set when its dispatch task ends.
struct InFlight {
    jobs: Arc<DashSet<JobId>>,
    id: JobId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.jobs.remove(&self.id);
    }
}

/// Finds due jobs, leases them and hands them to the [`Dispatcher`].
///
/// A job this scheduler is still dispatching is never leased again by it,
/// even after the lease expired; another worker may take it over, and the
/// stale dispatch then loses its lease token.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
    worker_id: String,
    in_flight: Arc<DashSet<JobId>>,
    lease_ttl: Duration,
    poll_interval: Duration,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        wake: Arc<Notify>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            wake,
            worker_id: format!("herald-{}", uuid::Uuid::new_v4()),
            in_flight: Arc::new(DashSet::new()),
            lease_ttl: config.lease_ttl(),
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
        }
    }

    /// Use a fixed lease owner name instead of a random one.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Jobs whose dispatch task has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Count jobs that became due while no scheduler was running.
    pub async fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        let overdue = self.store.due_before(now, usize::MAX).await?.len();
        if overdue > 0 {
            tracing::info!(overdue, worker = %self.worker_id, "restoring overdue jobs");
        } else {
            tracing::debug!(worker = %self.worker_id, "no overdue jobs to restore");
        }
        Ok(overdue)
    }

    /// One pass: lease every due job (up to the batch size) and spawn its
    /// dispatch into `tasks`. Returns the number of jobs claimed.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.due_before(now, self.batch_size).await?;
        let mut claimed = 0;

        for id in due {
            if !self.in_flight.insert(id) {
                tracing::debug!(job_id = %id, "still dispatching, skipping job");
                continue;
            }
            let guard = InFlight {
                jobs: Arc::clone(&self.in_flight),
                id,
            };

            match self
                .store
                .lease(&id, &self.worker_id, self.lease_ttl, now)
                .await
            {
                Ok(job) => {
                    claimed += 1;
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tasks.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = dispatcher.process(job).await {
                            tracing::warn!(job_id = %id, error = %e, "dispatch ended early");
                        }
                    });
                }
                Err(e) if Self::is_skippable(&e) => {
                    tracing::debug!(job_id = %id, reason = %e, "skipping job");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(claimed)
    }

    fn is_skippable(e: &JobError) -> bool {
        matches!(
            e,
            JobError::AlreadyLeased(_) | JobError::AlreadyTerminal(_) | JobError::NotFound(_)
        )
    }

    /// Run one pass and wait for every dispatch it started.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut tasks = JoinSet::new();
        let claimed = self.tick(&mut tasks).await?;
        while let Some(joined) = tasks.join_next().await {
            Self::log_join(joined);
        }
        Ok(claimed)
    }

    fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            tracing::error!(error = %e, "dispatch task panicked");
        }
    }

    async fn sleep_for(&self, claimed: usize) -> Duration {
        match self.store.next_due_at().await {
            Ok(Some(next)) => {
                let now = self.clock.now();
                if next <= now {
                    if claimed == 0 {
                        CONTENDED_BACKOFF
                    } else {
                        Duration::ZERO
                    }
                } else {
                    (next - now)
                        .to_std()
                        .unwrap_or(self.poll_interval)
                        .min(self.poll_interval)
                }
            }
            Ok(None) => self.poll_interval,
            Err(e) => {
                tracing::warn!(error = %e, "could not read next due time");
                self.poll_interval
            }
        }
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight
    /// dispatches to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        tracing::info!(worker = %self.worker_id, "scheduler started");

        let mut tasks = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.tick(&mut tasks).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "scheduler pass failed");
                    0
                }
            };
            let sleep = self.sleep_for(claimed).await;

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.wake.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => Self::log_join(joined),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "scheduler stopping, draining dispatches");
        while let Some(joined) = tasks.join_next().await {
            Self::log_join(joined);
        }
        tracing::info!(worker = %self.worker_id, "scheduler stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_id", &self.worker_id)
            .field("in_flight", &self.in_flight.len())
            .field("lease_ttl", &self.lease_ttl)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
