use sqlx::error::ErrorKind;

/// Errors surfaced by queue operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was rejected before touching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Freshly generated ids kept colliding with stored rows.
    #[error("id conflict persisted after {attempts} attempts")]
    Conflict {
        /// Total insert attempts made, including the first.
        attempts: u32,
    },

    /// Another writer held the database past the busy timeout.
    #[error("database contention: writer busy timeout exceeded")]
    Contention(#[source] sqlx::Error),

    /// The schema or a stored row failed to parse.
    #[error("store corruption: {0}")]
    StoreCorruption(String),

    /// A wait loop was interrupted by [`Queue::shutdown`](crate::Queue::shutdown).
    #[error("operation cancelled")]
    Cancelled,

    /// The consume handler returned an error; the message was NACKed.
    #[error("message handler failed")]
    Handler(#[source] anyhow::Error),

    /// Any other failure reported by the underlying store.
    #[error("storage error")]
    Storage(#[source] sqlx::Error),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            Self::Contention(err)
        } else {
            Self::Storage(err)
        }
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), plus the extended busy codes
// surfaced in WAL mode (261 BUSY_RECOVERY, 517 BUSY_SNAPSHOT).
fn is_busy(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|db| {
        matches!(
            db.code().as_deref(),
            Some("5" | "6" | "261" | "517" | "518")
        ) || db.message().contains("database is locked")
    })
}

/// True when an insert failed because the primary key already exists.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| matches!(db.kind(), ErrorKind::UniqueViolation))
}
