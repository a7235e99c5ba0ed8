#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_err, assert_le, assert_none, assert_some};
use duraq::{ConsumeOptions, Error, PopOptions, PutOptions, Queue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) async fn open_queue() -> anyhow::Result<(Queue, TempDir)> {
        let dir = tempfile::tempdir()?;
        let queue = Queue::open(dir.path().join("queue.db")).await?;
        Ok((queue, dir))
    }

    pub(super) async fn open_queue_with_retries(
        max_retries: u32,
    ) -> anyhow::Result<(Queue, TempDir)> {
        let dir = tempfile::tempdir()?;
        let queue = Queue::builder(dir.path().join("queue.db"))
            .max_retries(max_retries)
            .open()
            .await?;
        Ok((queue, dir))
    }

    /// Consume without long polling, so empty-queue tests return at once.
    pub(super) fn no_wait() -> ConsumeOptions {
        ConsumeOptions {
            wait: Duration::ZERO,
            ..ConsumeOptions::default()
        }
    }
}

#[tokio::test]
async fn successful_handler_acks_the_message() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    queue.put(b"task", "default", &PutOptions::default()).await?;

    let seen = queue
        .consume("default", &test_utils::no_wait(), |msg| async move {
            Ok(msg.data.clone())
        })
        .await?;
    assert_eq!(assert_some!(seen), b"task");

    assert_eq!(queue.qsize("default").await?, 0);
    assert_eq!(queue.dlq_size("default").await?, 0);

    Ok(())
}

#[tokio::test]
async fn empty_queue_skips_the_handler() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();
    let seen = queue
        .consume("default", &test_utils::no_wait(), |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;

    assert_none!(seen);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn failing_handler_nacks_and_surfaces_the_error() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    queue.put(b"task", "default", &PutOptions::default()).await?;

    let err = assert_err!(
        queue
            .consume("default", &test_utils::no_wait(), |_msg| async move {
                Err::<(), _>(anyhow::anyhow!("flaky downstream"))
            })
            .await
    );
    assert!(matches!(err, Error::Handler(_)), "{err:?}");

    // NACK made the message immediately eligible again, attempt recorded.
    let msg = assert_some!(queue.peek("default").await?);
    assert_eq!(msg.retry_count, 1);

    Ok(())
}

#[tokio::test]
async fn panicking_handler_nacks_before_the_panic_resumes() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    queue.put(b"task", "default", &PutOptions::default()).await?;

    let worker = queue.clone();
    let handle = tokio::spawn(async move {
        worker
            .consume("default", &test_utils::no_wait(), |_msg| async move {
                panic!("handler exploded");
            })
            .await
            .map(|seen: Option<()>| seen)
    });

    let join_err = handle.await.unwrap_err();
    assert!(join_err.is_panic());

    // The lease was settled by a NACK, not left to expire.
    let msg = assert_some!(queue.peek("default").await?);
    assert_eq!(msg.retry_count, 1);

    Ok(())
}

#[tokio::test]
async fn handler_failures_exhaust_the_budget_into_the_dlq() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue_with_retries(1).await?;

    queue.put(b"task", "default", &PutOptions::default()).await?;

    // Single attempt allowed: the first failure already sits at the budget
    // and dead-letters the message with the handler's reason.
    let err = assert_err!(
        queue
            .consume("default", &test_utils::no_wait(), |_msg| async move {
                Err::<(), _>(anyhow::anyhow!("permanent failure"))
            })
            .await
    );
    assert!(matches!(err, Error::Handler(_)), "{err:?}");

    assert_eq!(queue.qsize("default").await?, 0);
    assert_eq!(queue.dlq_size("default").await?, 1);
    assert_none!(
        queue
            .consume("default", &test_utils::no_wait(), |_msg| async move { Ok(()) })
            .await?
    );

    Ok(())
}

#[tokio::test]
async fn consume_long_polls_for_a_late_message() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    let producer = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        producer
            .put(b"late", "default", &PutOptions::default())
            .await
            .unwrap();
    });

    let opts = ConsumeOptions {
        wait: Duration::from_secs(10),
        ..ConsumeOptions::default()
    };
    let seen = queue
        .consume("default", &opts, |msg| async move { Ok(msg.data.clone()) })
        .await?;
    assert_eq!(assert_some!(seen), b"late");

    Ok(())
}

#[tokio::test]
async fn shutdown_interrupts_a_long_poll_promptly() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    let waiter = queue.clone();
    let handle = tokio::spawn(async move {
        let opts = PopOptions {
            wait: Duration::from_secs(30),
            ..PopOptions::default()
        };
        waiter.pop("default", &opts).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    queue.shutdown();

    let popped = handle.await??;
    assert_none!(popped);
    assert_le!(started.elapsed(), Duration::from_secs(2));

    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_join() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    // A visible message keeps join waiting.
    queue.put(b"task", "default", &PutOptions::default()).await?;

    let waiter = queue.clone();
    let handle = tokio::spawn(async move { waiter.join("default").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.shutdown();

    let err = assert_err!(handle.await?);
    assert!(matches!(err, Error::Cancelled), "{err:?}");

    Ok(())
}

#[tokio::test]
async fn join_returns_once_the_queue_drains() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::open_queue().await?;

    queue.put(b"task", "default", &PutOptions::default()).await?;

    let worker = queue.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let msg = worker
            .pop("default", &PopOptions::default())
            .await
            .unwrap()
            .unwrap();
        worker.delete(msg.id).await.unwrap();
    });

    queue.join("default").await?;
    handle.await?;
    assert_eq!(queue.qsize("default").await?, 0);

    Ok(())
}
