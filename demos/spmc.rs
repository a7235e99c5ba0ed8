//! Single producer, multiple consumers sharing one queue file.
//!
//! Run with:
//!
//! ```bash
//! cargo run --example spmc
//! ```

use duraq::{ConsumeOptions, PutOptions, Queue};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TASKS: u32 = 20;
const CONSUMERS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let queue = Queue::open(dir.path().join("spmc.db")).await?;

    // One producer enqueues numbered tasks.
    let producer = queue.clone();
    let producer_handle = tokio::spawn(async move {
        for i in 0..TASKS {
            let payload = format!("task {i}");
            producer
                .put(payload.as_bytes(), "work", &PutOptions::default())
                .await?;
        }
        info!(count = TASKS, "all tasks enqueued");
        Ok::<_, duraq::Error>(())
    });

    // Several consumers drain the queue through the scoped consume API:
    // a clean handler return ACKs, an error or panic NACKs.
    let mut consumers = Vec::new();
    for worker in 0..CONSUMERS {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let opts = ConsumeOptions {
                wait: Duration::from_secs(2),
                ..ConsumeOptions::default()
            };
            loop {
                let outcome = queue
                    .consume("work", &opts, |msg| async move {
                        let text = String::from_utf8_lossy(&msg.data).into_owned();
                        Ok(text)
                    })
                    .await?;
                match outcome {
                    Some(text) => info!(worker, task = %text, "processed"),
                    None => {
                        info!(worker, "queue drained, stopping");
                        return Ok::<_, duraq::Error>(());
                    }
                }
            }
        }));
    }

    producer_handle.await??;
    queue.join("work").await?;
    for handle in consumers {
        handle.await??;
    }

    info!(remaining = queue.qsize("work").await?, "done");
    Ok(())
}
