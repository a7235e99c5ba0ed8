//! SQLite store adapter: file opening, pragmas, schema, write transactions.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, error};

use crate::errors::{Error, Result};
use crate::schema::SCHEMA;

/// Opens the database file, creating it if missing, and prepares it for
/// concurrent producers and consumers: WAL so readers never block writers,
/// a busy timeout so contending writers wait instead of failing outright,
/// and the idempotent schema.
pub(crate) async fn connect(
    path: &Path,
    busy_timeout: Duration,
    max_connections: u32,
) -> Result<SqlitePool> {
    if path == Path::new(":memory:") {
        // A pooled in-memory database is a separate database per connection.
        return Err(Error::InvalidArgument(
            "in-memory databases are not supported",
        ));
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(_) => {
                error!(path = %path.display(), %err, "schema setup failed");
                Error::StoreCorruption(format!("schema setup failed: {err}"))
            }
            other => Error::from(other),
        })?;

    debug!(path = %path.display(), "message store ready");
    Ok(pool)
}

/// Begins a writer-reserving transaction.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so the read-then-reserve
/// sequence inside `pop` cannot race another writer reading the same
/// candidate row. The transaction rolls back when dropped without a commit,
/// which covers every early-return and error path.
pub(crate) async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    match pool.begin_with("BEGIN IMMEDIATE").await {
        Ok(tx) => Ok(tx),
        Err(err) => {
            let err = Error::from(err);
            if matches!(err, Error::Contention(_)) {
                debug!("writer reservation timed out under contention");
            }
            Err(err)
        }
    }
}
