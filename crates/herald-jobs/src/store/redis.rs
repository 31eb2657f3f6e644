use super::{lease_ttl, JobFilter, JobStore, OutcomeDelta};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, LeaseToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::Connection;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Optimistic transactions give up after this many conflicting writers.
const MAX_TX_RETRIES: usize = 16;

fn backend(e: redis::RedisError) -> JobError {
    JobError::BackendError(e.to_string())
}

/// Redis-backed job store.
///
/// Layout under `prefix`:
/// - `{prefix}:job:{id}` JSON record
/// - `{prefix}:wake` sorted set of non-terminal job ids scored by wake time (ms)
/// - `{prefix}:ids` set of every stored id
///
/// Mutations use `WATCH`/`MULTI` on the record key and retry on conflict.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| JobError::ConfigError(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    async fn connection(&self) -> Result<Connection> {
        self.client.get_async_connection().await.map_err(backend)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn wake_key(&self) -> String {
        format!("{}:wake", self.prefix)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    /// Queue the writes that persist `job` and its index entries.
    fn stage(&self, pipe: &mut redis::Pipeline, job: &JobRecord) -> Result<()> {
        let id = job.id.to_string();
        pipe.set(self.job_key(&job.id), serde_json::to_string(job)?)
            .ignore();
        match job.wake_at() {
            Some(wake_at) => pipe.zadd(self.wake_key(), &id, wake_at.timestamp_millis()),
            None => pipe.zrem(self.wake_key(), &id),
        }
        .ignore();
        pipe.sadd(self.ids_key(), &id).ignore();
        Ok(())
    }

    async fn load(&self, conn: &mut Connection, id: &JobId) -> Result<Option<JobRecord>> {
        let raw: Option<String> = conn.get(self.job_key(id)).await.map_err(backend)?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(JobError::from))
            .transpose()
    }

    async fn unwatch(conn: &mut Connection) {
        let _: redis::RedisResult<()> = redis::cmd("UNWATCH").query_async(conn).await;
    }

    /// Read-modify-write one record, optionally creating `extra` in the same
    /// transaction. Nothing is written if `f` fails.
    async fn mutate<F>(&self, id: &JobId, extra: Option<&JobRecord>, mut f: F) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()> + Send,
    {
        let mut conn = self.connection().await?;
        let key = self.job_key(id);

        for _ in 0..MAX_TX_RETRIES {
            let mut watch = redis::cmd("WATCH");
            watch.arg(&key);
            if let Some(extra) = extra {
                watch.arg(self.job_key(&extra.id));
            }
            let _: () = watch.query_async(&mut conn).await.map_err(backend)?;

            if let Some(extra) = extra {
                let exists: bool = conn.exists(self.job_key(&extra.id)).await.map_err(backend)?;
                if exists {
                    Self::unwatch(&mut conn).await;
                    return Err(JobError::AlreadyExists(extra.id));
                }
            }

            let mut job = match self.load(&mut conn, id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    Self::unwatch(&mut conn).await;
                    return Err(JobError::NotFound(*id));
                }
                Err(e) => {
                    Self::unwatch(&mut conn).await;
                    return Err(e);
                }
            };

            if let Err(e) = f(&mut job) {
                Self::unwatch(&mut conn).await;
                return Err(e);
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            self.stage(&mut pipe, &job)?;
            if let Some(extra) = extra {
                self.stage(&mut pipe, extra)?;
            }

            let committed: Option<()> = pipe.query_async(&mut conn).await.map_err(backend)?;
            if committed.is_some() {
                return Ok(job);
            }
            tracing::debug!(job_id = %id, "redis transaction conflict, retrying");
        }

        Err(JobError::BackendError(format!(
            "gave up on job {} after {} conflicting writes",
            id, MAX_TX_RETRIES
        )))
    }

    async fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.ids_key()).await.map_err(backend)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:job:{}", self.prefix, id))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        raw.into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(JobError::from))
            .collect()
    }

    fn is_removable(job: &JobRecord, all: &[JobRecord]) -> bool {
        job.is_terminal()
            && job.follow_ups.iter().all(|id| {
                all.iter()
                    .find(|other| other.id == *id)
                    .map(|follow_up| follow_up.is_terminal())
                    .unwrap_or(true)
            })
    }

    async fn delete_ids(&self, ids: &[JobId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids {
            let member = id.to_string();
            pipe.del(self.job_key(id)).ignore();
            pipe.zrem(self.wake_key(), &member).ignore();
            pipe.srem(self.ids_key(), &member).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn submit(&self, job: JobRecord) -> Result<JobId> {
        let mut conn = self.connection().await?;
        let created: bool = conn
            .set_nx(self.job_key(&job.id), serde_json::to_string(&job)?)
            .await
            .map_err(backend)?;
        if !created {
            return Err(JobError::AlreadyExists(job.id));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.stage(&mut pipe, &job)?;
        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        let mut conn = self.connection().await?;
        self.load(&mut conn, id).await?.ok_or(JobError::NotFound(*id))
    }

    async fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.wake_key(),
                "-inf",
                at.timestamp_millis(),
                0,
                isize::try_from(limit).unwrap_or(isize::MAX),
            )
            .await
            .map_err(backend)?;

        ids.iter()
            .map(|id| {
                id.parse()
                    .map_err(|e: uuid::Error| JobError::BackendError(e.to_string()))
            })
            .collect()
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.connection().await?;
        let first: Vec<(String, f64)> = conn
            .zrange_withscores(self.wake_key(), 0, 0)
            .await
            .map_err(backend)?;
        Ok(first
            .into_iter()
            .next()
            .and_then(|(_, ms)| DateTime::from_timestamp_millis(ms as i64)))
    }

    async fn lease(
        &self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let ttl = lease_ttl(ttl);
        self.mutate(id, None, |job| job.acquire_lease(owner, ttl, now).map(drop))
            .await
    }

    async fn update(
        &self,
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
        let follow_up_id = follow_up.as_ref().map(|job| job.id);

        self.mutate(id, follow_up.as_ref(), |job| {
            job.check_lease(lease)?;
            job.record_outcome(&destination, outcome.clone(), follow_up_id, now)
        })
        .await
    }

    async fn release(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, None, |job| {
            job.check_lease(lease)?;
            job.settle(now);
            Ok(())
        })
        .await
    }

    async fn cancel(
        &self,
        id: &JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, None, |job| job.cancel(reason.clone(), now))
            .await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by(|a, b| (a.due_at, a.id).cmp(&(b.due_at, b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        let all = self.load_all().await?;
        let job = all
            .iter()
            .find(|job| job.id == *id)
            .ok_or(JobError::NotFound(*id))?;
        if !Self::is_removable(job, &all) {
            return Err(JobError::NotRemovable(*id));
        }
        self.delete_ids(&[*id]).await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let all = self.load_all().await?;
        let expired: Vec<JobId> = all
            .iter()
            .filter(|job| job.finished_at.map(|at| at < before).unwrap_or(false))
            .filter(|job| Self::is_removable(job, &all))
            .map(|job| job.id)
            .collect();

        self.delete_ids(&expired).await?;
        Ok(expired.len())
    }
}
