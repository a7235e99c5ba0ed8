//! SQL operations over the `messages` and `dlq` tables.
//!
//! Mutating operations take an open transaction so callers control the
//! commit point; reads run directly against the pool.

use sqlx::{Sqlite, SqliteExecutor, Transaction};

use crate::schema::MessageRow;

const SELECT_NEXT_VISIBLE: &str = "
    SELECT id, queue_name, data, retry_count, created_at
    FROM messages
    WHERE queue_name = ? AND visible_after <= ?
    ORDER BY visible_after, created_at
    LIMIT 1
";

pub(crate) async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    queue_name: &str,
    data: &[u8],
    visible_after: i64,
    created_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, queue_name, data, visible_after, retry_count, created_at)
         VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(id)
    .bind(queue_name)
    .bind(data)
    .bind(visible_after)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Single multi-row insert; any id collision fails the whole statement and
/// the caller rolls the batch back.
pub(crate) async fn insert_batch(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
    ids: &[String],
    payloads: &[&[u8]],
    visible_after: i64,
    created_at: i64,
) -> Result<(), sqlx::Error> {
    let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
        "INSERT INTO messages (id, queue_name, data, visible_after, retry_count, created_at) ",
    );
    builder.push_values(ids.iter().zip(payloads), |mut row, (id, data)| {
        row.push_bind(id.as_str())
            .push_bind(queue_name)
            .push_bind(*data)
            .push_bind(visible_after)
            .push_bind(0_i64)
            .push_bind(created_at);
    });
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// The next deliverable row for the queue, oldest eligibility first.
pub(crate) async fn next_visible(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
    now: i64,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(SELECT_NEXT_VISIBLE)
        .bind(queue_name)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
}

/// Same candidate row as [`next_visible`], without the writer reservation.
pub(crate) async fn peek_visible(
    executor: impl SqliteExecutor<'_>,
    queue_name: &str,
    now: i64,
) -> Result<Option<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(SELECT_NEXT_VISIBLE)
        .bind(queue_name)
        .bind(now)
        .fetch_optional(executor)
        .await
}

/// Reserves the row for one consumer: hides it until `visible_after` and
/// counts the delivery attempt.
pub(crate) async fn lease(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    visible_after: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE messages SET visible_after = ?, retry_count = retry_count + 1 WHERE id = ?")
        .bind(visible_after)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Makes the row immediately eligible again, keeping its retry count.
pub(crate) async fn make_visible(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    now: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE messages SET visible_after = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes the row regardless of which queue holds it. Returns the number
/// of rows removed so callers can treat an absent row as a no-op.
pub(crate) async fn delete_message(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn insert_dlq(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    queue_name: &str,
    data: &[u8],
    failed_at: i64,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO dlq (id, queue_name, data, failed_at, reason) VALUES (?, ?, ?, ?, ?)")
        .bind(id)
        .bind(queue_name)
        .bind(data)
        .bind(failed_at)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn count_messages(
    executor: impl SqliteExecutor<'_>,
    queue_name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE queue_name = ?")
        .bind(queue_name)
        .fetch_one(executor)
        .await
}

pub(crate) async fn count_visible(
    executor: impl SqliteExecutor<'_>,
    queue_name: &str,
    now: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages WHERE queue_name = ? AND visible_after <= ?",
    )
    .bind(queue_name)
    .bind(now)
    .fetch_one(executor)
    .await
}

pub(crate) async fn count_dlq(
    executor: impl SqliteExecutor<'_>,
    queue_name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dlq WHERE queue_name = ?")
        .bind(queue_name)
        .fetch_one(executor)
        .await
}

pub(crate) async fn clear_messages(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM messages WHERE queue_name = ?")
        .bind(queue_name)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn clear_dlq(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM dlq WHERE queue_name = ?")
        .bind(queue_name)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// Moves every dead-lettered row for the queue back into `messages`,
/// immediately visible with a fresh retry budget. The original enqueue time
/// was lost at dead-letter time, so redriven rows are stamped with `now`.
pub(crate) async fn redrive_dlq(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
    now: i64,
) -> Result<u64, sqlx::Error> {
    let inserted = sqlx::query(
        "INSERT INTO messages (id, queue_name, data, visible_after, retry_count, created_at)
         SELECT id, queue_name, data, ?, 0, ?
         FROM dlq
         WHERE queue_name = ?",
    )
    .bind(now)
    .bind(now)
    .bind(queue_name)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM dlq WHERE queue_name = ?")
        .bind(queue_name)
        .execute(&mut **tx)
        .await?;

    Ok(inserted.rows_affected())
}
