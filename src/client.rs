use crate::errors::QueueError;
use crate::schema::Job;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

/// A queue client: the five atomic operations against the `spgq_jobs` table.
///
/// Stateless aside from the pool handle and a client identifier, which is
/// recorded in `last_reserved_by` on every reservation. Cloning is cheap and
/// clones share the pool.
///
/// Every operation is a single SQL statement that checks its precondition
/// and performs the transition atomically, returning the post-state row.
#[derive(Debug, Clone)]
pub struct Client {
    pool: PgPool,
    id: String,
}

impl Client {
    /// Create a client over `pool`, identifying itself as `id` on reservations.
    pub fn new(pool: PgPool, id: impl Into<String>) -> Self {
        Self {
            pool,
            id: id.into(),
        }
    }

    /// The client identifier written to `last_reserved_by`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new `ready` job on `queue` with the given payload.
    ///
    /// `reserve_after`, when given, keeps the job invisible to
    /// [`reserve`](Self::reserve) until the store clock passes it.
    #[instrument(name = "spgq.put", skip(self, args), fields(client.id = %self.id))]
    pub async fn put(
        &self,
        queue: &str,
        args: &[u8],
        reserve_after: Option<DateTime<Utc>>,
    ) -> Result<Job, QueueError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            INSERT INTO spgq_jobs (queue, args, reserve_after)
            VALUES ($1, $2, $3)
            RETURNING id, queue, args, status, last_reserved_by, last_error,
                      releases, created_at, updated_at, reserve_after
            ",
        )
        .bind(queue)
        .bind(args)
        .bind(reserve_after)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    /// Atomically reserve the oldest eligible job on `queue` for this client.
    ///
    /// Selection is FIFO by `updated_at`, ties broken by `id`, and skips rows
    /// locked by concurrent reservations, so N concurrent callers obtain N
    /// distinct jobs without serialising. Returns [`QueueError::NoJob`] when
    /// the queue has no eligible row.
    pub async fn reserve(&self, queue: &str) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>(
            r"
            UPDATE spgq_jobs
            SET status = 'reserved', last_reserved_by = $2, updated_at = now()
            WHERE id = (
                SELECT id
                FROM spgq_jobs
                WHERE queue = $1
                  AND status = 'ready'
                  AND (reserve_after IS NULL OR reserve_after < now())
                ORDER BY updated_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, queue, args, status, last_reserved_by, last_error,
                      releases, created_at, updated_at, reserve_after
            ",
        )
        .bind(queue)
        .bind(&self.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NoJob)
    }

    /// Release a reserved job back to `ready`, recording `error`.
    ///
    /// Increments the job's release counter. `reserve_after` is written as
    /// given, so `None` clears any previous delay. Since `updated_at` is
    /// refreshed, the released job lines up behind the current wave of ready
    /// jobs. Returns [`QueueError::NoJob`] unless the job is `reserved`.
    pub async fn release(
        &self,
        id: i64,
        error: &str,
        reserve_after: Option<DateTime<Utc>>,
    ) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>(
            r"
            UPDATE spgq_jobs
            SET status = 'ready', releases = releases + 1,
                last_error = $2, reserve_after = $3, updated_at = now()
            WHERE id = $1 AND status = 'reserved'
            RETURNING id, queue, args, status, last_reserved_by, last_error,
                      releases, created_at, updated_at, reserve_after
            ",
        )
        .bind(id)
        .bind(error)
        .bind(reserve_after)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NoJob)
    }

    /// Mark a reserved job as successfully completed.
    ///
    /// Returns [`QueueError::NoJob`] unless the job is `reserved`.
    pub async fn done(&self, id: i64) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>(
            r"
            UPDATE spgq_jobs
            SET status = 'done', updated_at = now()
            WHERE id = $1 AND status = 'reserved'
            RETURNING id, queue, args, status, last_reserved_by, last_error,
                      releases, created_at, updated_at, reserve_after
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NoJob)
    }

    /// Mark a reserved job as terminally failed, recording `error`.
    ///
    /// Returns [`QueueError::NoJob`] unless the job is `reserved`.
    pub async fn fail(&self, id: i64, error: &str) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>(
            r"
            UPDATE spgq_jobs
            SET status = 'failed', last_error = $2, updated_at = now()
            WHERE id = $1 AND status = 'reserved'
            RETURNING id, queue, args, status, last_reserved_by, last_error,
                      releases, created_at, updated_at, reserve_after
            ",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NoJob)
    }

    /// The number of `ready` jobs currently on `queue`.
    pub async fn ready_jobs(&self, queue: &str) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM spgq_jobs WHERE queue = $1 AND status = 'ready'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// The number of terminally `failed` jobs on `queue`.
    pub async fn failed_jobs(&self, queue: &str) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM spgq_jobs WHERE queue = $1 AND status = 'failed'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
