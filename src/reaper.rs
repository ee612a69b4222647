use std::{collections::HashMap, marker::PhantomData, time::Duration};
use tracing::{error, info};

use sqlx::PgPool;
use tokio::task::JoinSet;

/// Marker type for a reaper with at least one configured queue
#[derive(Clone, Copy, Debug)]
pub struct Configured;

/// Marker type for a reaper with no queues yet
#[derive(Clone, Copy, Debug)]
pub struct Unconfigured;

type QueueName = String;

/// The `Reaper` releases jobs stuck in `reserved` back to `ready`.
///
/// A job stays `reserved` forever when its worker crashes, or loses the
/// store between reserving and recording an outcome. The reaper spawns one
/// task per configured queue that periodically releases reservations whose
/// last transition is older than a threshold. A reap is an ordinary release
/// transition: it increments the job's release counter and records a
/// message in `last_error`.
///
/// The threshold must exceed the longest work a queue's functions perform,
/// otherwise a still-running job is handed out a second time.
/// Uses typestate to ensure you cannot start a reaper that will do nothing.
#[derive(Debug)]
pub struct Reaper<State = Unconfigured> {
    configurations: HashMap<QueueName, ReapConfiguration>,
    _state: PhantomData<State>,
}

/// When and how aggressively to reap a queue
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReapConfiguration {
    /// Interval at which to run
    pub reap_every: Duration,
    /// Reservations whose last transition is older than this are released
    pub max_reserved_age: chrono::Duration,
}

impl Default for ReapConfiguration {
    fn default() -> Self {
        Self {
            reap_every: Duration::from_secs(60),
            max_reserved_age: chrono::Duration::seconds(1800),
        }
    }
}

impl Reaper {
    /// Create a new, unconfigured, `Reaper`
    pub fn new() -> Reaper<Unconfigured> {
        Reaper {
            configurations: HashMap::new(),
            _state: PhantomData,
        }
    }

    async fn reap_queue(queue: QueueName, config: ReapConfiguration, pool: PgPool) {
        let mut ticker = tokio::time::interval(config.reap_every);
        let message = format!(
            "released by reaper: reserved for more than {}s",
            config.max_reserved_age.num_seconds()
        );

        loop {
            ticker.tick().await;

            let result = sqlx::query(
                r"
                UPDATE spgq_jobs
                SET status = 'ready', releases = releases + 1,
                    last_error = $2, updated_at = now()
                WHERE queue = $1 AND status = 'reserved' AND updated_at < now() - $3
                ",
            )
            .bind(&queue)
            .bind(&message)
            .bind(config.max_reserved_age)
            .execute(&pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => {
                    info!(
                        queue = %queue,
                        released = done.rows_affected(),
                        "reaped stuck reservations"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!("failed to reap stuck jobs for {}: {}", queue, e);
                    break;
                }
            }
        }
    }
}

impl Default for Reaper<Unconfigured> {
    fn default() -> Self {
        Reaper::new()
    }
}

impl<State> Reaper<State> {
    /// Configure the reaper for a specific queue
    pub fn configure(
        mut self,
        queue: impl Into<QueueName>,
        configuration: ReapConfiguration,
    ) -> Reaper<Configured> {
        self.configurations.insert(queue.into(), configuration);

        Reaper {
            configurations: self.configurations,
            _state: PhantomData,
        }
    }
}

impl Reaper<Configured> {
    /// Start the reaper, spawning a task for each configured queue.
    /// Returns a `JoinSet` containing all spawned tasks for easy cancellation
    pub fn run(self, pool: &PgPool) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for (queue, config) in self.configurations {
            set.spawn(Reaper::reap_queue(queue, config, pool.clone()));
        }
        set
    }
}
