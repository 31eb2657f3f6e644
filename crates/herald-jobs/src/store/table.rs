//! In-process job table shared by the memory and file stores.

use super::{lease_ttl, JobFilter, OutcomeDelta};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, LeaseToken};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Records plus an ordered index of their wake times.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobTable {
    records: HashMap<JobId, JobRecord>,
    wake_index: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl JobTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.values()
    }

    /// Insert or overwrite, keeping the wake index in sync.
    fn put(&mut self, record: JobRecord) {
        if let Some(old) = self.records.get(&record.id) {
            if let Some(wake_at) = old.wake_at() {
                self.wake_index.remove(&(wake_at, old.id));
            }
        }
        if let Some(wake_at) = record.wake_at() {
            self.wake_index.insert((wake_at, record.id));
        }
        self.records.insert(record.id, record);
    }

    /// Apply `f` to a copy and commit only if it succeeds.
    fn mutate<F>(&mut self, id: &JobId, f: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()>,
    {
        let mut next = self
            .records
            .get(id)
            .cloned()
            .ok_or(JobError::NotFound(*id))?;
        f(&mut next)?;
        self.put(next.clone());
        Ok(next)
    }

    /// Load a record as-is, for restoring a snapshot.
    pub(crate) fn restore(&mut self, record: JobRecord) {
        self.put(record);
    }

    pub(crate) fn submit(&mut self, job: JobRecord) -> Result<JobId> {
        if self.records.contains_key(&job.id) {
            return Err(JobError::AlreadyExists(job.id));
        }
        let id = job.id;
        self.put(job);
        Ok(id)
    }

    pub(crate) fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.records.get(id).cloned().ok_or(JobError::NotFound(*id))
    }

    pub(crate) fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Vec<JobId> {
        self.wake_index
            .iter()
            .take_while(|(wake_at, _)| *wake_at <= at)
            .take(limit)
            .map(|(_, id)| *id)
            .collect()
    }

    pub(crate) fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.wake_index.iter().next().map(|(wake_at, _)| *wake_at)
    }

    pub(crate) fn lease(
        &mut self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, |job| job.acquire_lease(owner, lease_ttl(ttl), now).map(drop))
    }

    pub(crate) fn update(
        &mut self,
        id: &JobId,
        lease: &LeaseToken,
        delta: OutcomeDelta,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let OutcomeDelta {
            destination,
            outcome,
            follow_up,
        } = delta;

        if let Some(job) = &follow_up {
            if self.records.contains_key(&job.id) {
                return Err(JobError::AlreadyExists(job.id));
            }
        }

        let follow_up_id = follow_up.as_ref().map(|job| job.id);
        let updated = self.mutate(id, |job| {
            job.check_lease(lease)?;
            job.record_outcome(&destination, outcome, follow_up_id, now)
        })?;

        if let Some(job) = follow_up {
            self.put(job);
        }
        Ok(updated)
    }

    pub(crate) fn release(
        &mut self,
        id: &JobId,
        lease: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, |job| {
            job.check_lease(lease)?;
            job.settle(now);
            Ok(())
        })
    }

    pub(crate) fn cancel(
        &mut self,
        id: &JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, |job| job.cancel(reason, now))
    }

    pub(crate) fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .records
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.due_at, a.id).cmp(&(b.due_at, b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    fn is_removable(&self, job: &JobRecord) -> bool {
        job.is_terminal()
            && job.follow_ups.iter().all(|id| {
                self.records
                    .get(id)
                    .map(|follow_up| follow_up.is_terminal())
                    .unwrap_or(true)
            })
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> Result<()> {
        let job = self.records.get(id).ok_or(JobError::NotFound(*id))?;
        if !self.is_removable(job) {
            return Err(JobError::NotRemovable(*id));
        }
        self.records.remove(id);
        Ok(())
    }

    pub(crate) fn purge_finished(&mut self, before: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .records
            .values()
            .filter(|job| job.finished_at.map(|at| at < before).unwrap_or(false))
            .filter(|job| self.is_removable(job))
            .map(|job| job.id)
            .collect();

        for id in &expired {
            self.records.remove(id);
        }
        expired.len()
    }
}
