use super::{lease_ttl, JobFilter, JobStore, OutcomeDelta};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobRecord, LeaseToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use std::time::Duration;

fn backend(e: sqlx::Error) -> JobError {
    JobError::BackendError(e.to_string())
}

/// Postgres-backed job store.
///
/// The full record lives in a JSONB column; the columns next to it are
/// projections used for indexing and filtering. Mutations lock the row with
/// `SELECT ... FOR UPDATE` and rewrite it in the same transaction.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    table_name: String,
}

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>, table_name: &str) -> Self {
        Self {
            pool,
            table_name: table_name.to_string(),
        }
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                owner TEXT,
                due_at TIMESTAMPTZ NOT NULL,
                wake_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                record JSONB NOT NULL
            )
            "#,
            self.table_name
        );
        let create_wake_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_wake_at ON {} (wake_at, id) WHERE wake_at IS NOT NULL",
            self.table_name, self.table_name
        );
        let create_owner_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_owner ON {} (owner)",
            self.table_name, self.table_name
        );

        for statement in [create_table, create_wake_index, create_owner_index] {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn insert<'e, E>(&self, executor: E, job: &JobRecord) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = format!(
            r#"
            INSERT INTO {} (id, kind, state, owner, due_at, wake_at, finished_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
            self.table_name
        );

        let inserted = sqlx::query(&query)
            .bind(job.id.to_string())
            .bind(job.kind().as_str())
            .bind(job.state.as_str())
            .bind(&job.owner)
            .bind(job.due_at)
            .bind(job.wake_at())
            .bind(job.finished_at)
            .bind(Json(job))
            .execute(executor)
            .await
            .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            return Err(JobError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn lock_row(&self, tx: &mut Transaction<'_, Postgres>, id: &JobId) -> Result<JobRecord> {
        let query = format!("SELECT record FROM {} WHERE id = $1 FOR UPDATE", self.table_name);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?
            .ok_or(JobError::NotFound(*id))?;

        let Json(record): Json<JobRecord> = row.try_get("record").map_err(backend)?;
        Ok(record)
    }

    async fn store_row(&self, tx: &mut Transaction<'_, Postgres>, job: &JobRecord) -> Result<()> {
        let query = format!(
            r#"
            UPDATE {}
            SET state = $2, wake_at = $3, finished_at = $4, record = $5
            WHERE id = $1
            "#,
            self.table_name
        );

        sqlx::query(&query)
            .bind(job.id.to_string())
            .bind(job.state.as_str())
            .bind(job.wake_at())
            .bind(job.finished_at)
            .bind(Json(job))
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Lock, mutate and rewrite one record. Nothing is written if `f` fails.
    async fn mutate<F>(&self, id: &JobId, f: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut job = self.lock_row(&mut tx, id).await?;
        f(&mut job)?;
        self.store_row(&mut tx, &job).await?;
        tx.commit().await.map_err(backend)?;
        Ok(job)
    }

    async fn fetch_records(&self, query: &str, id: Option<&str>) -> Result<Vec<JobRecord>> {
        let mut q = sqlx::query(query);
        if let Some(id) = id {
            q = q.bind(id.to_string());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter()
            .map(|row| {
                let Json(record): Json<JobRecord> = row.try_get("record").map_err(backend)?;
                Ok(record)
            })
            .collect()
    }

    /// Removal check: terminal, and every follow-up terminal or gone.
    async fn is_removable(&self, job: &JobRecord) -> Result<bool> {
        if !job.is_terminal() {
            return Ok(false);
        }
        if job.follow_ups.is_empty() {
            return Ok(true);
        }

        let ids: Vec<String> = job.follow_ups.iter().map(|id| id.to_string()).collect();
        let query = format!(
            "SELECT COUNT(*) AS open FROM {} WHERE id = ANY($1) AND finished_at IS NULL",
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(&ids)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let open: i64 = row.try_get("open").map_err(backend)?;
        Ok(open == 0)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn submit(&self, job: JobRecord) -> Result<JobId> {
        self.insert(&self.pool, &job).await?;
        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        let query = format!("SELECT record FROM {} WHERE id = $1", self.table_name);
        let id_text = id.to_string();
        self.fetch_records(&query, Some(&id_text))
            .await?
            .into_iter()
            .next()
            .ok_or(JobError::NotFound(*id))
    }

    async fn due_before(&self, at: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let query = format!(
            r#"
            SELECT id FROM {}
            WHERE wake_at IS NOT NULL AND wake_at <= $1
            ORDER BY wake_at ASC, id ASC
            LIMIT $2
            "#,
            self.table_name
        );

        let rows = sqlx::query(&query)
            .bind(at)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(backend)?;
                id.parse()
                    .map_err(|e: uuid::Error| JobError::BackendError(e.to_string()))
            })
            .collect()
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let query = format!("SELECT MIN(wake_at) AS next FROM {}", self.table_name);
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("next").map_err(backend)
    }

    async fn lease(
        &self,
        id: &JobId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let ttl = lease_ttl(ttl);
        self.mutate(id, |job| job.acquire_lease(owner, ttl, now).map(drop))
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

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut job = self.lock_row(&mut tx, id).await?;
        job.check_lease(lease)?;
        job.record_outcome(&destination, outcome, follow_up.as_ref().map(|f| f.id), now)?;
        self.store_row(&mut tx, &job).await?;
        if let Some(follow_up) = &follow_up {
            self.insert(&mut *tx, follow_up).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(job)
    }

    async fn release(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.mutate(id, |job| {
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
        self.mutate(id, |job| job.cancel(reason, now)).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let query = match &filter.owner {
            Some(_) => format!(
                "SELECT record FROM {} WHERE owner = $1 ORDER BY due_at ASC, id ASC",
                self.table_name
            ),
            None => format!(
                "SELECT record FROM {} ORDER BY due_at ASC, id ASC",
                self.table_name
            ),
        };

        let mut jobs: Vec<JobRecord> = self
            .fetch_records(&query, filter.owner.as_deref())
            .await?
            .into_iter()
            .filter(|job| filter.matches(job))
            .collect();
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        let job = self.get(id).await?;
        if !self.is_removable(&job).await? {
            return Err(JobError::NotRemovable(*id));
        }

        let query = format!("DELETE FROM {} WHERE id = $1", self.table_name);
        sqlx::query(&query)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let query = format!(
            "SELECT record FROM {} WHERE finished_at IS NOT NULL AND finished_at < $1",
            self.table_name
        );
        let rows = sqlx::query(&query)
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut removable = Vec::new();
        for row in &rows {
            let Json(job): Json<JobRecord> = row.try_get("record").map_err(backend)?;
            if self.is_removable(&job).await? {
                removable.push(job.id.to_string());
            }
        }

        if removable.is_empty() {
            return Ok(0);
        }

        let query = format!("DELETE FROM {} WHERE id = ANY($1)", self.table_name);
        let deleted = sqlx::query(&query)
            .bind(&removable)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(deleted.rows_affected() as usize)
    }
}
