use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    error::Error,
    message::{ArchivedMessage, MessageState},
};

use super::ListQuery;

/// Position in the `(created_at, uuid)` ordering used to walk archives once.
pub type ArchiveCursor = (DateTime<Utc>, Uuid);

impl ArchivedMessage {
    pub async fn insert(db: &mut SqliteConnection, archive: &ArchivedMessage) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO hl7_in_archive
                (uuid, source_id, source_key, payload, created_at, message_state, loaded, migrated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(archive.envelope.uuid)
        .bind(archive.envelope.source_id)
        .bind(archive.envelope.source_key.as_deref())
        .bind(archive.payload())
        .bind(archive.envelope.created_at)
        .bind(archive.message_state)
        .bind(archive.is_loaded())
        .bind(archive.migrated_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(
        db: &mut SqliteConnection,
        uuid: Uuid,
    ) -> Result<Option<ArchivedMessage>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, loaded, migrated_at
            FROM hl7_in_archive
            WHERE uuid = $1
            ",
        )
        .bind(uuid)
        .fetch_optional(db)
        .await?)
    }

    /// Up to `limit` processed archives created before `cutoff` whose payload is still in
    /// the database, strictly after `after` in `(created_at, uuid)` order.
    pub async fn eligible_for_migration(
        db: &mut SqliteConnection,
        cutoff: DateTime<Utc>,
        after: Option<ArchiveCursor>,
        limit: u32,
    ) -> Result<Vec<ArchivedMessage>, Error> {
        let (after_created, after_uuid) = after.unzip();

        let mut stream = sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, loaded, migrated_at
            FROM hl7_in_archive
            WHERE loaded = TRUE
              AND message_state = $1
              AND created_at < $2
              AND ($3 IS NULL OR created_at > $3 OR (created_at = $3 AND uuid > $4))
            ORDER BY created_at, uuid
            LIMIT $5
            ",
        )
        .bind(MessageState::Processed)
        .bind(cutoff)
        .bind(after_created)
        .bind(after_uuid)
        .bind(limit as i64)
        .fetch(db);

        let mut archives = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            archives.push(res);
        }

        Ok(archives)
    }

    /// Clears the stored payload of a migrated archive. Returns `false` if the row was
    /// already unloaded or is gone.
    pub async fn mark_migrated(
        db: &mut SqliteConnection,
        uuid: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE hl7_in_archive
            SET payload = NULL, loaded = FALSE, message_state = $2, migrated_at = $3
            WHERE uuid = $1 AND loaded = TRUE
            ",
        )
        .bind(uuid)
        .bind(MessageState::Migrated)
        .bind(at)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn list(
        db: &mut SqliteConnection,
        query: &ListQuery,
    ) -> Result<Vec<ArchivedMessage>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, message_state, loaded, migrated_at
            FROM hl7_in_archive
            WHERE ($1 IS NULL OR message_state = $1)
              AND ($2 IS NULL OR payload LIKE $2 OR source_key LIKE $2)
            ORDER BY created_at, uuid
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(query.state)
        .bind(query.pattern())
        .bind(query.limit())
        .bind(query.offset())
        .fetch(db);

        let mut archives = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            archives.push(res);
        }

        Ok(archives)
    }

    pub async fn count(db: &mut SqliteConnection, query: &ListQuery) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM hl7_in_archive
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
