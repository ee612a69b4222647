//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the job queue.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

/// Represents one unit of work, persisted as a row in the `spgq_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job, assigned by the store on insert
    pub id: i64,
    /// Name of the queue the job belongs to
    pub queue: String,
    /// Opaque payload; never inspected by the queue
    pub args: Vec<u8>,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Identifier of the client currently or most recently holding the job
    pub last_reserved_by: Option<String>,
    /// Error message recorded by the most recent release or fail
    pub last_error: Option<String>,
    /// Number of times the job has been released back to the queue
    pub releases: i32,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent state transition
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job is eligible for reservation, if delayed
    pub reserve_after: Option<DateTime<Utc>>,
}

/// Lifecycle state of a [`Job`].
///
/// `Done` and `Failed` are terminal; no operation transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "spgq_job_status", rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for reservation once `reserve_after` has passed
    Ready,
    /// Held by exactly one client
    Reserved,
    /// Completed successfully
    Done,
    /// Gave up after exhausting its release budget
    Failed,
}

/// Create the `spgq_jobs` table and supporting types if they are missing.
///
/// Runs the crate's embedded migrations against the given pool.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
