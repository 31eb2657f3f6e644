use super::{JobFilter, JobStore, JobTable, OutcomeDelta};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, LeaseToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// In-memory job store (not persistent, for testing/dev)
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    table: Arc<Mutex<JobTable>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, JobTable>> {
        self.table
            .lock()
            .map_err(|_| JobError::BackendError("Lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn submit(&self, job: JobRecord) -> Result<JobId> {
        self.table()?.submit(job)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.table()?.get(id)
    }

    async fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        Ok(self.table()?.due_before(at, limit))
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.table()?.next_due_at())
    }

    async fn lease(
        &self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.table()?.lease(id, owner, ttl, now)
    }

    async fn update(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        delta: OutcomeDelta,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.table()?.update(id, lease, delta, now)
    }

    async fn release(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.table()?.release(id, lease, now)
    }

    async fn cancel(
        &self,
        id: &JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.table()?.cancel(id, reason, now)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        Ok(self.table()?.list(filter))
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        self.table()?.remove(id)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.table()?.purge_finished(before))
    }
}
