//! The queue engine: enqueue, lease, acknowledge, dead-letter, redrive.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Error, Result, is_unique_violation};
use crate::ids::IdGenerator;
use crate::schema::Message;
use crate::store;
use crate::storage;
use crate::util::unix_now;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const DEFAULT_CONFLICT_BACKOFF: Duration = Duration::from_millis(50);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `put_batch` refuses larger inputs.
pub const MAX_BATCH: usize = 50;

/// Knobs for [`Queue::put`] and [`Queue::put_batch`].
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Delay before the message first becomes visible. Truncated to whole
    /// seconds; zero means immediately eligible.
    pub delay: Duration,
    /// Extra insert attempts after an id collision before giving up.
    pub conflict_retries: u32,
    /// Sleep between collision attempts.
    pub conflict_backoff: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            conflict_backoff: DEFAULT_CONFLICT_BACKOFF,
        }
    }
}

/// Knobs for [`Queue::pop`].
#[derive(Debug, Clone)]
pub struct PopOptions {
    /// How long the message stays hidden from other consumers once leased.
    pub visibility_timeout: Duration,
    /// Long-poll budget: how long to keep retrying an empty queue before
    /// returning `None`. Zero returns after a single attempt.
    pub wait: Duration,
    /// Sleep between attempts while long-polling.
    pub poll_interval: Duration,
    /// Random extra sleep added to each poll, de-synchronizing workers that
    /// woke up together. Zero disables jitter.
    pub poll_jitter: Duration,
}

impl Default for PopOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            wait: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: Duration::ZERO,
        }
    }
}

/// Knobs for [`Queue::consume`](crate::Queue::consume).
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Visibility timeout for the underlying `pop`. Choose a value larger
    /// than the worst-case handler runtime.
    pub visibility_timeout: Duration,
    /// Long-poll budget for the underlying `pop`.
    pub wait: Duration,
    /// Sleep between attempts while long-polling.
    pub poll_interval: Duration,
    /// Random extra sleep added to each poll.
    pub poll_jitter: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            wait: Duration::from_secs(20),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: Duration::ZERO,
        }
    }
}

impl ConsumeOptions {
    pub(crate) fn pop_options(&self) -> PopOptions {
        PopOptions {
            visibility_timeout: self.visibility_timeout,
            wait: self.wait,
            poll_interval: self.poll_interval,
            poll_jitter: self.poll_jitter,
        }
    }
}

/// Configures and opens a [`Queue`].
#[derive(Debug, Clone)]
pub struct QueueBuilder {
    path: PathBuf,
    max_retries: u32,
    busy_timeout: Duration,
    max_connections: u32,
}

impl QueueBuilder {
    fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Delivery-attempt budget before a message is dead-lettered.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// How long a writer waits for the file lock before the operation fails
    /// with [`Error::Contention`].
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Connection pool size shared by all clones of the opened queue.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Opens the database file, applying the schema if needed.
    pub async fn open(self) -> Result<Queue> {
        let pool = store::connect(&self.path, self.busy_timeout, self.max_connections).await?;
        Ok(Queue {
            pool,
            max_retries: i64::from(self.max_retries),
            ids: IdGenerator::new(),
            shutdown: Arc::new(watch::channel(false).0),
        })
    }
}

/// Outcome of a single lease attempt.
enum Fetch {
    Delivered(Message),
    /// A poisoned row was diverted to the DLQ; the queue may still hold a
    /// deliverable message, so the caller retries at once.
    DeadLettered,
    Empty,
}

/// Handle to one message store.
///
/// Cloning is cheap: clones share the connection pool and the shutdown
/// signal. Several handles (or OS processes) may point at the same file and
/// interoperate through SQLite's own locking.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    max_retries: i64,
    ids: IdGenerator,
    shutdown: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Opens a queue with default settings (retry budget 5, busy timeout 5 s).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder(path).open().await
    }

    /// Starts configuring a queue.
    pub fn builder(path: impl AsRef<Path>) -> QueueBuilder {
        QueueBuilder::new(path)
    }

    /// Enqueues one payload and returns its id.
    ///
    /// On a primary-key collision the id is regenerated and the insert
    /// retried per [`PutOptions::conflict_retries`]; nothing is stored until
    /// an attempt commits.
    pub async fn put(&self, data: &[u8], qname: &str, opts: &PutOptions) -> Result<Uuid> {
        let mut attempts = 0_u32;
        loop {
            let now = unix_now();
            let visible_after = now.saturating_add(whole_seconds(opts.delay));
            let id = self.ids.generate();

            let mut tx = store::begin_write(&self.pool).await?;
            match storage::insert_message(
                &mut tx,
                &id.to_string(),
                qname,
                data,
                visible_after,
                now,
            )
            .await
            {
                Ok(()) => {
                    tx.commit().await?;
                    debug!(%id, queue = qname, "message enqueued");
                    return Ok(id);
                }
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    attempts += 1;
                    if attempts > opts.conflict_retries {
                        return Err(Error::Conflict { attempts });
                    }
                    warn!(%id, queue = qname, "id collision on insert, regenerating");
                    tokio::time::sleep(opts.conflict_backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Enqueues up to [`MAX_BATCH`] payloads atomically.
    ///
    /// All rows are written by a single multi-row insert inside one writer
    /// transaction; an id collision rolls the whole batch back and retries
    /// it with regenerated ids. Returned ids correspond positionally to the
    /// input payloads.
    pub async fn put_batch(
        &self,
        payloads: &[impl AsRef<[u8]>],
        qname: &str,
        opts: &PutOptions,
    ) -> Result<Vec<Uuid>> {
        if payloads.len() > MAX_BATCH {
            return Err(Error::InvalidArgument("batch larger than 50 messages"));
        }
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let views: Vec<&[u8]> = payloads.iter().map(AsRef::as_ref).collect();

        let mut attempts = 0_u32;
        loop {
            let now = unix_now();
            let visible_after = now.saturating_add(whole_seconds(opts.delay));
            let ids: Vec<Uuid> = views.iter().map(|_| self.ids.generate()).collect();
            let id_texts: Vec<String> = ids.iter().map(Uuid::to_string).collect();

            let mut tx = store::begin_write(&self.pool).await?;
            match storage::insert_batch(&mut tx, qname, &id_texts, &views, visible_after, now)
                .await
            {
                Ok(()) => {
                    tx.commit().await?;
                    debug!(queue = qname, count = ids.len(), "batch enqueued");
                    return Ok(ids);
                }
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    attempts += 1;
                    if attempts > opts.conflict_retries {
                        return Err(Error::Conflict { attempts });
                    }
                    warn!(queue = qname, count = ids.len(), "id collision in batch, regenerating");
                    tokio::time::sleep(opts.conflict_backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Leases the next eligible message, or returns `None` once the
    /// long-poll budget is spent.
    ///
    /// Each attempt runs as one writer transaction: select the oldest
    /// eligible row, hide it for [`PopOptions::visibility_timeout`], and
    /// count the delivery attempt. Rows that already used up the retry
    /// budget are diverted to the DLQ and the scan continues within the
    /// same call. The returned handle carries the post-increment
    /// `retry_count`, so a first delivery reads 1.
    pub async fn pop(&self, qname: &str, opts: &PopOptions) -> Result<Option<Message>> {
        let deadline = Instant::now() + opts.wait;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            match self.try_pop(qname, opts.visibility_timeout).await? {
                Fetch::Delivered(msg) => return Ok(Some(msg)),
                Fetch::DeadLettered => continue,
                Fetch::Empty => {}
            }
            if Instant::now() >= deadline || *shutdown.borrow() {
                return Ok(None);
            }
            debug!(queue = qname, "queue empty, polling again");
            tokio::select! {
                () = tokio::time::sleep(with_jitter(opts.poll_interval, opts.poll_jitter)) => {}
                _ = shutdown.changed() => {
                    debug!(queue = qname, "long poll interrupted by shutdown");
                    return Ok(None);
                }
            }
        }
    }

    async fn try_pop(&self, qname: &str, visibility_timeout: Duration) -> Result<Fetch> {
        let mut tx = store::begin_write(&self.pool).await?;
        let now = unix_now();

        let Some(row) = storage::next_visible(&mut tx, qname, now).await? else {
            tx.commit().await?;
            return Ok(Fetch::Empty);
        };

        if row.retry_count >= self.max_retries {
            storage::insert_dlq(
                &mut tx,
                &row.id,
                &row.queue_name,
                &row.data,
                now,
                "max retries exceeded",
            )
            .await?;
            storage::delete_message(&mut *tx, &row.id).await?;
            tx.commit().await?;
            info!(
                id = %row.id,
                queue = qname,
                retry_count = row.retry_count,
                "retry budget exhausted, message dead-lettered"
            );
            return Ok(Fetch::DeadLettered);
        }

        let attempt = row.retry_count + 1;
        let lease_until = now.saturating_add(whole_seconds(visibility_timeout));
        storage::lease(&mut tx, &row.id, lease_until).await?;
        tx.commit().await?;

        let msg = row.into_message(attempt)?;
        debug!(id = %msg.id, queue = qname, attempt, "message leased");
        Ok(Fetch::Delivered(msg))
    }

    /// Returns the next eligible message without leasing it.
    pub async fn peek(&self, qname: &str) -> Result<Option<Message>> {
        let row = storage::peek_visible(&self.pool, qname, unix_now()).await?;
        row.map(|row| {
            let retry_count = row.retry_count;
            row.into_message(retry_count)
        })
        .transpose()
    }

    /// Acknowledges a message, removing it from whatever queue holds it.
    ///
    /// Deleting an id that is no longer present is a silent no-op: after a
    /// lease expires the row may already have been re-leased and
    /// acknowledged by another worker.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let deleted = storage::delete_message(&self.pool, &id.to_string()).await?;
        if deleted == 0 {
            debug!(%id, "acknowledged message already gone");
        } else {
            debug!(%id, "message acknowledged");
        }
        Ok(())
    }

    /// NACKs a leased message.
    ///
    /// Below the retry budget the message becomes immediately eligible
    /// again, keeping the retry count `pop` assigned; at
    /// `retry_count >= max_retries` it moves to the DLQ carrying `reason`.
    /// A message with `retry_count == max_retries - 1` therefore gets one
    /// more delivery before its next NACK dead-letters it. If the row is
    /// already gone (lease expired, another worker settled it) the call is
    /// a no-op.
    pub async fn process_failed(&self, msg: &Message, reason: &str) -> Result<()> {
        warn!(
            id = %msg.id,
            queue = %msg.queue_name,
            retry_count = msg.retry_count,
            reason,
            "message processing failed"
        );
        let mut tx = store::begin_write(&self.pool).await?;
        let now = unix_now();
        let id = msg.id.to_string();

        if msg.retry_count >= self.max_retries {
            let deleted = storage::delete_message(&mut *tx, &id).await?;
            if deleted > 0 {
                storage::insert_dlq(&mut tx, &id, &msg.queue_name, &msg.data, now, reason).await?;
                info!(id = %msg.id, queue = %msg.queue_name, "message dead-lettered");
            }
        } else if storage::make_visible(&mut tx, &id, now).await? == 0 {
            debug!(id = %msg.id, "failed message already gone");
        }

        tx.commit().await?;
        Ok(())
    }

    /// Number of messages in the queue, leased rows included. The count is
    /// a snapshot; concurrent activity can make it stale immediately.
    pub async fn qsize(&self, qname: &str) -> Result<i64> {
        Ok(storage::count_messages(&self.pool, qname).await?)
    }

    /// Number of messages currently eligible for delivery.
    pub async fn visible_size(&self, qname: &str) -> Result<i64> {
        Ok(storage::count_visible(&self.pool, qname, unix_now()).await?)
    }

    /// Number of dead-lettered messages for the queue.
    pub async fn dlq_size(&self, qname: &str) -> Result<i64> {
        Ok(storage::count_dlq(&self.pool, qname).await?)
    }

    /// True iff no message in the queue is currently visible. Leased rows
    /// do not count, so `empty` can be true while `qsize` is not zero.
    pub async fn empty(&self, qname: &str) -> Result<bool> {
        Ok(self.visible_size(qname).await? == 0)
    }

    /// Deletes every message in the queue; with `dlq` also its
    /// dead-lettered rows.
    pub async fn clear(&self, qname: &str, dlq: bool) -> Result<()> {
        let mut tx = store::begin_write(&self.pool).await?;
        let purged = storage::clear_messages(&mut tx, qname).await?;
        let dead_lettered = if dlq {
            storage::clear_dlq(&mut tx, qname).await?
        } else {
            0
        };
        tx.commit().await?;
        info!(queue = qname, purged, dead_lettered, "queue cleared");
        Ok(())
    }

    /// Waits until the queue has no visible messages.
    ///
    /// Leased rows do not count as visible, so returning does not mean
    /// every message was acknowledged. [`Queue::shutdown`] interrupts the
    /// wait with [`Error::Cancelled`].
    pub async fn join(&self, qname: &str) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.empty(qname).await? {
                return Ok(());
            }
            if *shutdown.borrow() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                () = tokio::time::sleep(JOIN_POLL_INTERVAL) => {}
                _ = shutdown.changed() => return Err(Error::Cancelled),
            }
        }
    }

    /// Moves every dead-lettered message for the queue back into play, with
    /// a fresh retry budget and immediate visibility. Returns the number of
    /// messages moved.
    ///
    /// Drain active consumers first: redrive reuses the original ids, and a
    /// straggler's late `delete` would acknowledge the redriven copy.
    pub async fn redrive(&self, qname: &str) -> Result<u64> {
        let mut tx = store::begin_write(&self.pool).await?;
        let moved = storage::redrive_dlq(&mut tx, qname, unix_now()).await?;
        tx.commit().await?;
        if moved > 0 {
            info!(queue = qname, moved, "dead-lettered messages redriven");
        }
        Ok(moved)
    }

    /// Interrupts every in-flight long poll and `join` on this store
    /// handle, clones included. Stored messages and live leases are
    /// untouched; the handle remains usable.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

fn whole_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
}
