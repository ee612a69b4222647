use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Error surface of the five queue client operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The operation's atomic precondition matched no row.
    ///
    /// For `reserve` this means the queue is momentarily empty. For
    /// `release`, `done` and `fail` it means the job has already progressed,
    /// and the call must be treated as "already handled, do nothing".
    #[error("no job matched")]
    NoJob,

    /// Any other failure surfaced by the database driver.
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Rejected worker configuration, reported synchronously by `Worker::start`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A subscribed queue has an empty name.
    #[error("queue name must not be empty")]
    EmptyQueueName,
}

/// Failure of a single work-function attempt.
///
/// Carries the error to record on the job, and optionally the earliest time
/// at which the job should become visible to reservation again. The hint is
/// only honoured when the job is released; it has no effect on success or on
/// a terminal fail.
#[derive(Debug)]
pub struct WorkError {
    pub(crate) error: anyhow::Error,
    pub(crate) reserve_after: Option<DateTime<Utc>>,
}

impl WorkError {
    /// Wrap an error with no reservation delay.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            reserve_after: None,
        }
    }

    /// Keep the job invisible to reservation until `at` if it is released.
    #[must_use]
    pub fn reserve_after(mut self, at: DateTime<Utc>) -> Self {
        self.reserve_after = Some(at);
        self
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl From<anyhow::Error> for WorkError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}
