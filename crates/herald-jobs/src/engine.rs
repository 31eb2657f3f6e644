//! Wiring of store, limiter, dispatcher and scheduler.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{JobError, Result};
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::service::JobService;
use crate::store::JobStore;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// A fully wired engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    service: JobService,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine on the wall clock.
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_clock(store, transport, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let wake = Arc::new(Notify::new());
        let limiter = Arc::new(RateLimiter::new(
            config.destination_bucket(),
            config.global_bucket(),
            Arc::clone(&clock),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&limiter),
            Arc::clone(&clock),
            Arc::clone(&wake),
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            Arc::clone(&wake),
            &config,
        ));
        let service = JobService::new(Arc::clone(&store), clock, wake, &config);

        Ok(Self {
            service,
            scheduler,
            dispatcher,
            limiter,
            store,
            config,
        })
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the scheduler loop on the current runtime.
    pub fn spawn(&self) -> EngineHandle {
        let (shutdown, rx) = watch::channel(false);
        let scheduler = Arc::clone(&self.scheduler);
        let task = tokio::spawn(scheduler.run(rx));
        EngineHandle { shutdown, task }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl EngineHandle {
    /// Stop taking new jobs and wait for in-flight dispatches.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| JobError::BackendError(format!("scheduler task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
