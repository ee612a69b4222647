#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_matches, assert_none, assert_some_eq};
use spgq::{Client, JobStatus, QueueError, setup_database};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }
}

#[tokio::test]
async fn put_reserve_done_flow() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let job = client.put("test-queue", b"{}", None).await?;
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.releases, 0);
    assert_none!(job.last_reserved_by.as_deref());
    assert_none!(job.reserve_after);

    let reserved = client.reserve("test-queue").await?;
    assert_eq!(reserved.id, job.id);
    assert_eq!(reserved.status, JobStatus::Reserved);
    assert_some_eq!(reserved.last_reserved_by.as_deref(), "test-client");

    let done = client.done(job.id).await?;
    assert_eq!(done.status, JobStatus::Done);

    // Terminal: the job never comes back, and repeating the op is a no-op.
    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));
    assert_matches!(client.done(job.id).await, Err(QueueError::NoJob));

    Ok(())
}

#[tokio::test]
async fn release_makes_job_reservable_again() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let job = client.put("test-queue", b"{}", None).await?;
    client.reserve("test-queue").await?;

    let released = client.release(job.id, "flaky downstream", None).await?;
    assert_eq!(released.status, JobStatus::Ready);
    assert_eq!(released.releases, 1);

    let again = client.reserve("test-queue").await?;
    assert_eq!(again.id, job.id);
    assert_eq!(again.releases, 1);
    assert_some_eq!(again.last_error.as_deref(), "flaky downstream");

    client.done(job.id).await?;

    Ok(())
}

#[tokio::test]
async fn delayed_release_is_invisible_until_due() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let job = client.put("test-queue", b"{}", None).await?;
    client.reserve("test-queue").await?;

    let resume_at = Utc::now() + chrono::Duration::milliseconds(100);
    client.release(job.id, "retry later", Some(resume_at)).await?;

    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));

    sleep(Duration::from_millis(200)).await;

    let reserved = client.reserve("test-queue").await?;
    assert_eq!(reserved.id, job.id);

    Ok(())
}

#[tokio::test]
async fn delayed_put_is_invisible_until_due() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let reserve_after = Utc::now() + chrono::Duration::milliseconds(100);
    let job = client
        .put("test-queue", b"{}", Some(reserve_after))
        .await?;

    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));

    sleep(Duration::from_millis(200)).await;

    let reserved = client.reserve("test-queue").await?;
    assert_eq!(reserved.id, job.id);

    Ok(())
}

#[tokio::test]
async fn fail_is_terminal() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let job = client.put("test-queue", b"{}", None).await?;
    client.reserve("test-queue").await?;

    let failed = client.fail(job.id, "epic fail").await?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_some_eq!(failed.last_error.as_deref(), "epic fail");

    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));
    assert_matches!(client.fail(job.id, "again").await, Err(QueueError::NoJob));

    Ok(())
}

#[tokio::test]
async fn ops_on_missing_job_return_no_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));
    assert_matches!(
        client.release(999, "epic fail", None).await,
        Err(QueueError::NoJob)
    );
    assert_matches!(client.done(999).await, Err(QueueError::NoJob));
    assert_matches!(client.fail(999, "epic fail").await, Err(QueueError::NoJob));

    Ok(())
}

#[tokio::test]
async fn released_job_lines_up_behind_ready_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    let first = client.put("test-queue", b"1", None).await?;
    let second = client.put("test-queue", b"2", None).await?;

    let reserved = client.reserve("test-queue").await?;
    assert_eq!(reserved.id, first.id);

    // An undelayed release refreshes updated_at, so the job goes to the
    // back of the current ready wave.
    client.release(first.id, "try again", None).await?;

    assert_eq!(client.reserve("test-queue").await?.id, second.id);
    assert_eq!(client.reserve("test-queue").await?.id, first.id);

    Ok(())
}

#[tokio::test]
async fn reserve_hands_out_distinct_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone(), "client-a");
    let other = Client::new(pool, "client-b");

    let first = client.put("test-queue", b"{}", None).await?;
    let second = client.put("test-queue", b"{}", None).await?;

    let a = client.reserve("test-queue").await?;
    let b = other.reserve("test-queue").await?;

    assert_eq!(a.id, first.id);
    assert_eq!(b.id, second.id);
    assert_some_eq!(a.last_reserved_by.as_deref(), "client-a");
    assert_some_eq!(b.last_reserved_by.as_deref(), "client-b");

    assert_matches!(client.reserve("test-queue").await, Err(QueueError::NoJob));

    Ok(())
}

#[tokio::test]
async fn queues_are_isolated() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool, "test-client");

    client.put("queue-a", b"{}", None).await?;

    assert_matches!(client.reserve("queue-b").await, Err(QueueError::NoJob));

    let reserved = client.reserve("queue-a").await?;
    assert_eq!(reserved.queue, "queue-a");

    assert_eq!(client.ready_jobs("queue-a").await?, 0);
    client.fail(reserved.id, "nope").await?;
    assert_eq!(client.failed_jobs("queue-a").await?, 1);
    assert_eq!(client.failed_jobs("queue-b").await?, 0);

    Ok(())
}
