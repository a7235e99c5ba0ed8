#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

//! Chaos drain: many producers, many misbehaving workers, and the
//! conservation property — every payload that went in is acknowledged
//! exactly once, nothing is lost to crashes or handler errors.

use duraq::{PopOptions, PutOptions, Queue};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOTAL: u32 = 2_000;
const PRODUCERS: u32 = 10;
const WORKERS: u32 = 8;
const VISIBILITY: Duration = Duration::from_secs(1);
const CRASH_RATE: f64 = 0.25;
const ERROR_RATE: f64 = 0.05;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn every_payload_survives_the_grinder() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Queue::builder(dir.path().join("grinder.db"))
        .max_retries(50)
        .open()
        .await?;

    // Producer phase: TOTAL integers as 4-byte big-endian payloads.
    let mut producers = Vec::new();
    let per_producer = TOTAL / PRODUCERS;
    for p in 0..PRODUCERS {
        let queue = queue.clone();
        producers.push(tokio::spawn(async move {
            for i in (p * per_producer)..((p + 1) * per_producer) {
                queue
                    .put(&i.to_be_bytes(), "grind", &PutOptions::default())
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in producers {
        handle.await?;
    }
    assert_eq!(queue.qsize("grind").await?, i64::from(TOTAL));

    // Chaos phase: workers crash without ACK, fail in the handler, or ACK.
    let acked: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
    let done = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let queue = queue.clone();
        let acked = acked.clone();
        let done = done.clone();
        workers.push(tokio::spawn(async move {
            let opts = PopOptions {
                visibility_timeout: VISIBILITY,
                wait: Duration::from_millis(200),
                ..PopOptions::default()
            };
            while !done.load(Ordering::SeqCst) {
                let Some(msg) = queue.pop("grind", &opts).await.unwrap() else {
                    continue;
                };

                let roll: f64 = rand::thread_rng().r#gen();
                if roll < CRASH_RATE {
                    // Crash without settling; the lease expires on its own.
                    continue;
                }
                if roll < CRASH_RATE + ERROR_RATE {
                    queue.process_failed(&msg, "induced failure").await.unwrap();
                    continue;
                }

                let value = u32::from_be_bytes(msg.data.as_slice().try_into().unwrap());
                queue.delete(msg.id).await.unwrap();
                let count = {
                    let mut acked = acked.lock().unwrap();
                    acked.insert(value);
                    acked.len()
                };
                if count == TOTAL as usize {
                    done.store(true, Ordering::SeqCst);
                }
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(120), async {
        for handle in workers {
            handle.await.unwrap();
        }
    })
    .await
    .expect("grinder did not drain in time");

    let acked = acked.lock().unwrap();
    let expected: HashSet<u32> = (0..TOTAL).collect();
    assert_eq!(*acked, expected);
    assert_eq!(queue.dlq_size("grind").await?, 0);
    assert_eq!(queue.qsize("grind").await?, 0);

    Ok(())
}
