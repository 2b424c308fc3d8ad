//! Job scheduling for descriptor runs.

pub mod worker;

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::StoreError;

const MAX_ATTEMPTS: i32 = 5;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, descriptor_id: Uuid) -> Result<(), StoreError>;

    async fn enqueue_after(&self, descriptor_id: Uuid, delay: Duration) -> Result<(), StoreError>;
}

/// A due job handed to one worker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedJob {
    pub descriptor_id: Uuid,
    pub strict: bool,
    pub run_at: DateTime<Utc>,
}

/// Job table in Postgres, claimed with `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn schedule(
        &self,
        descriptor_id: Uuid,
        run_at: DateTime<Utc>,
        strict: bool,
    ) -> Result<(), StoreError> {
        // An existing row keeps its mode and is simply moved in time.
        sqlx::query(
            "INSERT INTO descriptor_jobs (descriptor_id, strict, run_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (descriptor_id) DO UPDATE
             SET run_at = EXCLUDED.run_at, locked_until = NULL, attempts = 0",
        )
        .bind(descriptor_id)
        .bind(strict)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queues the strict variant for a descriptor already tied to a subject.
    pub async fn enqueue_strict(&self, descriptor_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO descriptor_jobs (descriptor_id, strict, run_at)
             VALUES ($1, TRUE, NOW())
             ON CONFLICT (descriptor_id) DO UPDATE
             SET strict = TRUE, run_at = NOW(), locked_until = NULL, attempts = 0",
        )
        .bind(descriptor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Leases up to `limit` due jobs for `lease`.
    pub async fn claim(&self, limit: i64, lease: Duration) -> Result<Vec<ClaimedJob>, StoreError> {
        let locked_until = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(10));
        let jobs = sqlx::query_as::<_, ClaimedJob>(
            "WITH due AS (
                 SELECT descriptor_id FROM descriptor_jobs
                 WHERE run_at <= NOW()
                   AND (locked_until IS NULL OR locked_until < NOW())
                   AND attempts < $3
                 ORDER BY run_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE descriptor_jobs AS job
             SET locked_until = $2, attempts = job.attempts + 1
             FROM due
             WHERE job.descriptor_id = due.descriptor_id
             RETURNING job.descriptor_id, job.strict, job.run_at",
        )
        .bind(limit)
        .bind(locked_until)
        .bind(MAX_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Drops the job unless it was rescheduled while running.
    pub async fn complete(&self, job: &ClaimedJob) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM descriptor_jobs WHERE descriptor_id = $1 AND run_at <= $2")
            .bind(job.descriptor_id)
            .bind(job.run_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, descriptor_id: Uuid) -> Result<(), StoreError> {
        self.schedule(descriptor_id, Utc::now(), false).await
    }

    async fn enqueue_after(&self, descriptor_id: Uuid, delay: Duration) -> Result<(), StoreError> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.schedule(descriptor_id, Utc::now() + delay, false).await
    }
}

/// Records scheduling calls; used where no job table exists.
#[derive(Default)]
pub struct MemoryQueue {
    scheduled: Mutex<Vec<(Uuid, Duration)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(Uuid, Duration)> {
        self.scheduled
            .lock()
            .map(|scheduled| scheduled.clone())
            .unwrap_or_default()
    }

    fn push(&self, descriptor_id: Uuid, delay: Duration) -> Result<(), StoreError> {
        self.scheduled
            .lock()
            .map_err(|_| StoreError::Corrupt("memory queue lock poisoned".into()))?
            .push((descriptor_id, delay));
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, descriptor_id: Uuid) -> Result<(), StoreError> {
        self.push(descriptor_id, Duration::ZERO)
    }

    async fn enqueue_after(&self, descriptor_id: Uuid, delay: Duration) -> Result<(), StoreError> {
        self.push(descriptor_id, delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_queue_records_delays() {
        let queue = MemoryQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(id).await.unwrap();
        queue.enqueue_after(id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(
            queue.scheduled(),
            vec![(id, Duration::ZERO), (id, Duration::from_secs(60))]
        );
    }
}
