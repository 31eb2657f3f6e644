//! File-backed job store.
//!
//! The whole table is kept in memory and written as a JSON snapshot after
//! every mutation. A mutation is applied to a copy of the table, the copy is
//! written to disk, and only then does it replace the live table; a failed
//! write leaves memory and disk as they were. Snapshots go to a sibling temp
//! file that is renamed over the previous one, so a crash leaves either the
//! old or the new state on disk, never a torn file.
//!
//! Each mutation copies and rewrites the entire table, so this store suits
//! single-process deployments with modest job counts. Use the Postgres or
//! Redis backend beyond that.

use super::{JobFilter, JobStore, JobTable, OutcomeDelta};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, LeaseToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    jobs: Vec<&'a JobRecord>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    jobs: Vec<JobRecord>,
}

/// Durable single-process job store backed by one JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileStore {
    /// Open the store at `path`, restoring any existing snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    JobError::BackendError(format!("Failed to create directories: {}", e))
                })?;
            }
        }

        let mut table = JobTable::new();
        if path.exists() {
            let bytes = std::fs::read(&path)
                .map_err(|e| JobError::BackendError(format!("Failed to read snapshot: {}", e)))?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(JobError::BackendError(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            for job in snapshot.jobs {
                table.restore(job);
            }
            tracing::info!(path = %path.display(), jobs = table.len(), "restored job snapshot");
        }

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `table` and write it to disk on the blocking pool.
    async fn persist(&self, table: &JobTable) -> Result<()> {
        let mut jobs: Vec<&JobRecord> = table.records().collect();
        jobs.sort_by_key(|job| job.id);
        let bytes = serde_json::to_vec(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            jobs,
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &bytes))
            .await
            .map_err(|e| JobError::BackendError(format!("Snapshot writer failed: {}", e)))?
            .map_err(|e| JobError::BackendError(format!("Failed to write snapshot: {}", e)))
    }

    /// Run a mutation against a copy of the table, persist the copy, then
    /// make it live.
    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobTable) -> Result<T> + Send,
        T: Send,
    {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let value = f(&mut next)?;
        self.persist(&next).await?;
        *table = next;
        Ok(value)
    }
}

fn write_snapshot(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl JobStore for FileStore {
    async fn submit(&self, job: JobRecord) -> Result<JobId> {
        self.write(|table| table.submit(job)).await
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.table.lock().await.get(id)
    }

    async fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        Ok(self.table.lock().await.due_before(at, limit))
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.table.lock().await.next_due_at())
    }

    async fn lease(
        &self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.write(|table| table.lease(id, owner, ttl, now)).await
    }

    async fn update(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        delta: OutcomeDelta,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.write(|table| table.update(id, lease, delta, now)).await
    }

    async fn release(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.write(|table| table.release(id, lease, now)).await
    }

    async fn cancel(
        &self,
        id: &JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.write(|table| table.cancel(id, reason, now)).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        Ok(self.table.lock().await.list(filter))
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        self.write(|table| table.remove(id)).await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        self.write(|table| Ok(table.purge_finished(before))).await
    }
}
