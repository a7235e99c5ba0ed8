//! Table definitions and row types for the message store.

use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::Error;

/// Queue used when the caller does not name one.
pub const DEFAULT_QUEUE: &str = "default";

// `messages` holds live rows; the (queue_name, visible_after, created_at)
// index is the eligibility and ordering key for dequeue. `dlq` holds rows
// that exhausted their retry budget. STRICT tables require SQLite 3.37+.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    queue_name    TEXT NOT NULL DEFAULT 'default',
    data          BLOB NOT NULL,
    visible_after INTEGER NOT NULL,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_messages_pop
    ON messages (queue_name, visible_after, created_at);

CREATE TABLE IF NOT EXISTS dlq (
    id         TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    data       BLOB NOT NULL,
    failed_at  INTEGER NOT NULL,
    reason     TEXT NOT NULL
) STRICT;
";

/// A live row as stored, before the id is parsed.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct MessageRow {
    pub(crate) id: String,
    pub(crate) queue_name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) retry_count: i64,
    pub(crate) created_at: i64,
}

/// A message leased from the queue.
#[derive(Debug, Clone)]
pub struct Message {
    /// Time-ordered unique identifier.
    pub id: Uuid,
    /// The payload, byte-exact as enqueued.
    pub data: Vec<u8>,
    /// Logical partition this message belongs to.
    pub queue_name: String,
    /// Delivery attempts made so far, including the one that produced this handle.
    pub retry_count: i64,
    /// Enqueue time, unix seconds UTC.
    pub created_at: i64,
}

impl MessageRow {
    /// `retry_count` is supplied by the caller: `pop` hands out the
    /// post-increment value, `peek` the stored one.
    pub(crate) fn into_message(self, retry_count: i64) -> Result<Message, Error> {
        let id = Uuid::parse_str(&self.id).map_err(|err| {
            tracing::error!(id = %self.id, %err, "stored message id failed to parse");
            Error::StoreCorruption(format!("malformed message id {:?}: {err}", self.id))
        })?;
        Ok(Message {
            id,
            data: self.data,
            queue_name: self.queue_name,
            retry_count,
            created_at: self.created_at,
        })
    }
}
