use sqlx::SqliteConnection;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    error::Error,
    message::{MessageState, PendingEntry},
};

use super::ListQuery;

impl PendingEntry {
    pub async fn insert(db: &mut SqliteConnection, entry: &PendingEntry) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO hl7_in_queue
                (uuid, source_id, source_key, payload, created_at, message_state, last_error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(entry.envelope.uuid)
        .bind(entry.envelope.source_id)
        .bind(entry.envelope.source_key.as_deref())
        .bind(&entry.payload)
        .bind(entry.envelope.created_at)
        .bind(entry.message_state)
        .bind(entry.last_error_message.as_deref())
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, uuid: Uuid) -> Result<Option<PendingEntry>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, last_error_message
            FROM hl7_in_queue
            WHERE uuid = $1
            ",
        )
        .bind(uuid)
        .fetch_optional(db)
        .await?)
    }

    /// Oldest entry still waiting to be processed.
    pub async fn next(db: &mut SqliteConnection) -> Result<Option<PendingEntry>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, last_error_message
            FROM hl7_in_queue
            WHERE message_state = $1
            ORDER BY created_at, id
            LIMIT 1
            ",
        )
        .bind(MessageState::Pending)
        .fetch_optional(db)
        .await?)
    }

    /// Moves the entry from `Pending` to `Processing`. Returns `false` if the row was not
    /// pending anymore.
    pub async fn claim(db: &mut SqliteConnection, uuid: Uuid) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE hl7_in_queue
            SET message_state = $2
            WHERE uuid = $1 AND message_state = $3
            ",
        )
        .bind(uuid)
        .bind(MessageState::Processing)
        .bind(MessageState::Pending)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Puts a claimed entry back in the queue.
    pub async fn release(
        db: &mut SqliteConnection,
        uuid: Uuid,
        last_error: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            UPDATE hl7_in_queue
            SET message_state = $2, last_error_message = $3
            WHERE uuid = $1 AND message_state = $4
            ",
        )
        .bind(uuid)
        .bind(MessageState::Pending)
        .bind(last_error)
        .bind(MessageState::Processing)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Requeues every entry left in `Processing`, e.g. by a process that stopped while
    /// draining. Returns how many were requeued.
    pub async fn release_stale(db: &mut SqliteConnection) -> Result<u64, Error> {
        let res = sqlx::query("UPDATE hl7_in_queue SET message_state = $1 WHERE message_state = $2")
            .bind(MessageState::Pending)
            .bind(MessageState::Processing)
            .execute(db)
            .await?;

        Ok(res.rows_affected())
    }

    pub async fn delete(db: &mut SqliteConnection, uuid: Uuid) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM hl7_in_queue WHERE uuid = $1")
            .bind(uuid)
            .execute(db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn list(
        db: &mut SqliteConnection,
        query: &ListQuery,
    ) -> Result<Vec<PendingEntry>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, last_error_message
            FROM hl7_in_queue
            WHERE ($1 IS NULL OR message_state = $1)
              AND ($2 IS NULL OR payload LIKE $2 OR source_key LIKE $2)
            ORDER BY created_at, id
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(query.state)
        .bind(query.pattern())
        .bind(query.limit())
        .bind(query.offset())
        .fetch(db);

        let mut entries = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            entries.push(res);
        }

        Ok(entries)
    }

    pub async fn count(db: &mut SqliteConnection, query: &ListQuery) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM hl7_in_queue
            WHERE ($1 IS NULL OR message_state = $1)
              AND ($2 IS NULL OR payload LIKE $2 OR source_key LIKE $2)
            ",
        )
        .bind(query.state)
        .bind(query.pattern())
        .fetch_one(db)
        .await?)
    }
}
