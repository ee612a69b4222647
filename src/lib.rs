#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod errors;
mod reaper;
/// Database schema definitions.
pub mod schema;
mod util;
mod worker;

/// The queue client exposing the five atomic job operations.
pub use self::client::Client;
/// Error types for client operations, worker configuration and work functions.
pub use self::errors::{ConfigError, QueueError, WorkError};
/// Recovery of jobs stuck in the `reserved` state.
pub use self::reaper::{ReapConfiguration, Reaper};
/// The persisted job row and its lifecycle status.
pub use self::schema::{Job, JobStatus, setup_database};
/// The multi-queue worker and the handle to its executors.
pub use self::worker::{Worker, WorkerHandle};
