use crate::client::Client;
use crate::errors::{ConfigError, QueueError, WorkError};
use crate::schema::Job;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Marker type for a worker with at least one subscribed queue
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for a worker with no subscriptions yet
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

type WorkFn = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>;

struct Subscription {
    queue: String,
    work: WorkFn,
}

/// A multi-queue worker: a fixed group of cooperative executors draining
/// subscribed queues in strict priority order.
///
/// Built incrementally with [`subscribe`](Self::subscribe); the first
/// subscription is the primary queue, later ones are polled in declared
/// order only when every queue before them is momentarily empty. Uses
/// typestate so a worker without any subscription cannot be started.
pub struct Worker<State = Unconfigured> {
    client: Client,
    queues: Vec<Subscription>,
    concurrency: usize,
    max_releases: u32,
    poll_interval: Duration,
    jitter: Duration,
    _state: PhantomData<State>,
}

impl<State> fmt::Debug for Worker<State> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("client", &self.client.id())
            .field(
                "queues",
                &self.queues.iter().map(|s| &s.queue).collect::<Vec<_>>(),
            )
            .field("concurrency", &self.concurrency)
            .field("max_releases", &self.max_releases)
            .finish()
    }
}

impl Worker {
    /// Create a worker over `client` with no subscriptions yet.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queues: Vec::new(),
            concurrency: 1,
            max_releases: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            _state: PhantomData,
        }
    }
}

impl<State> Worker<State> {
    /// Subscribe to `queue`, running `work` for every job reserved from it.
    ///
    /// Subscriptions are polled in the order they were declared; the first
    /// one is the primary queue. After any successfully reserved job the
    /// executor restarts from the primary, so lower queues are only served
    /// while all higher queues are empty.
    pub fn subscribe<F, Fut>(mut self, queue: &str, work: F) -> Worker<Configured>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.queues.push(Subscription {
            queue: queue.into(),
            work: Arc::new(move |job| work(job).boxed()),
        });

        Worker {
            client: self.client,
            queues: self.queues,
            concurrency: self.concurrency,
            max_releases: self.max_releases,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            _state: PhantomData,
        }
    }

    /// Set the number of executor tasks. Zero is treated as one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set how many times a job may be released before an erroring attempt
    /// marks it as failed instead. Defaults to zero: the first error fails
    /// the job.
    pub fn max_releases(mut self, max_releases: u32) -> Self {
        self.max_releases = max_releases;
        self
    }

    /// Set how long an executor sleeps when every subscribed queue is empty.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each poll sleep.
    ///
    /// Jitter spreads out the polling of executors that went idle at the
    /// same moment. The applied jitter is a random value between zero and
    /// the given duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Worker<Configured> {
    /// Validate the configuration and spawn the executor tasks.
    ///
    /// Returns a [`ConfigError`] without spawning anything if a subscribed
    /// queue has an empty name.
    pub fn start(self) -> Result<WorkerHandle, ConfigError> {
        if self.queues.iter().any(|sub| sub.queue.is_empty()) {
            return Err(ConfigError::EmptyQueueName);
        }

        let concurrency = self.concurrency.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let executor = Arc::new(Executor {
            client: self.client,
            queues: self.queues,
            max_releases: self.max_releases,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
        });

        let mut handles = Vec::with_capacity(concurrency);
        for index in 1..=concurrency {
            let executor = Arc::clone(&executor);
            let shutdown = shutdown_rx.clone();
            let span = info_span!(
                "executor",
                client.id = %executor.client.id(),
                executor.index = index
            );

            handles.push(tokio::spawn(async move {
                executor.run(shutdown).instrument(span).await;
            }));
        }

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            handles,
        })
    }
}

/// Handle to a started worker's executor tasks.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal every executor to stop, then wait for all of them to return.
    ///
    /// Executors observe the signal between jobs and between queue polls; an
    /// in-flight work function runs to completion. Callers needing a
    /// deadline must wrap this in their own timeout.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "executor task panicked");
            }
        });
    }
}

struct Executor {
    client: Client,
    queues: Vec<Subscription>,
    max_releases: u32,
    poll_interval: Duration,
    jitter: Duration,
}

impl Executor {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("executor started");

        'poll: loop {
            if *shutdown.borrow() {
                break;
            }

            for sub in &self.queues {
                if *shutdown.borrow() {
                    break 'poll;
                }

                match self.client.reserve(&sub.queue).await {
                    Ok(job) => {
                        self.perform(sub, job).await;
                        // Restart from the primary queue after working a job.
                        continue 'poll;
                    }
                    Err(QueueError::NoJob) => {}
                    Err(QueueError::Store(error)) => {
                        error!(queue = %sub.queue, %error, "failed to reserve a job");
                        self.idle(&mut shutdown).await;
                        continue 'poll;
                    }
                }
            }

            self.idle(&mut shutdown).await;
        }

        info!("executor stopped");
    }

    /// Run the work function for one reserved job and record the outcome.
    async fn perform(&self, sub: &Subscription, job: Job) {
        let span = info_span!(
            "job",
            job.id = job.id,
            job.queue = %job.queue,
            job.releases = job.releases
        );

        async {
            info!("job reserved");
            let job_id = job.id;
            let releases = u32::try_from(job.releases).unwrap_or_default();

            let start = Instant::now();
            let result = AssertUnwindSafe((sub.work)(job))
                .catch_unwind()
                .await
                .map_err(|payload| WorkError::new(try_to_extract_panic_info(&*payload)))
                // TODO: replace with Result::flatten() once that stabilizes
                .and_then(std::convert::identity);
            let elapsed = start.elapsed();

            match result {
                Ok(()) => {
                    info!(?elapsed, "job performed");
                    self.conclude(self.client.done(job_id).await, "done");
                }
                Err(error) => {
                    info!(?elapsed, %error, "job performed with error");
                    let message = format!("{:#}", error.error);
                    if releases >= self.max_releases {
                        self.conclude(self.client.fail(job_id, &message).await, "failed");
                    } else {
                        self.conclude(
                            self.client
                                .release(job_id, &message, error.reserve_after)
                                .await,
                            "released",
                        );
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    fn conclude(&self, result: Result<Job, QueueError>, action: &str) {
        match result {
            Ok(_) => info!("job {action}"),
            // The job has already progressed elsewhere; nothing to record.
            Err(QueueError::NoJob) => {}
            Err(QueueError::Store(error)) => {
                error!(%error, "failed to mark job as {action}");
            }
        }
    }

    /// Sleep out the polling period, waking early on the shutdown signal.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            () = sleep(self.sleep_duration_with_jitter()) => {}
        }
    }

    /// Calculate the poll sleep with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}
