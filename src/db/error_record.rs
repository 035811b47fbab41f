use sqlx::SqliteConnection;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{error::Error, message::ErrorRecord};

use super::ListQuery;

impl ErrorRecord {
    /// Validates the record before writing it.
    pub async fn insert(db: &mut SqliteConnection, record: &ErrorRecord) -> Result<(), Error> {
        record.validate()?;

        sqlx::query(
            "
            INSERT INTO hl7_in_error
                (uuid, source_id, source_key, payload, created_at, error_summary, error_detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(record.envelope.uuid)
        .bind(record.envelope.source_id)
        .bind(record.envelope.source_key.as_deref())
        .bind(&record.payload)
        .bind(record.envelope.created_at)
        .bind(&record.error_summary)
        .bind(record.error_detail())
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, uuid: Uuid) -> Result<Option<ErrorRecord>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, error_summary, error_detail
            FROM hl7_in_error
            WHERE uuid = $1
            ",
        )
        .bind(uuid)
        .fetch_optional(db)
        .await?)
    }

    pub async fn delete(db: &mut SqliteConnection, uuid: Uuid) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM hl7_in_error WHERE uuid = $1")
            .bind(uuid)
            .execute(db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Lists error records. The state filter does not apply here.
    pub async fn list(
        db: &mut SqliteConnection,
        query: &ListQuery,
    ) -> Result<Vec<ErrorRecord>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT uuid, source_id, source_key, payload, created_at, error_summary, error_detail
            FROM hl7_in_error
            WHERE ($1 IS NULL OR payload LIKE $1 OR source_key LIKE $1 OR error_summary LIKE $1)
            ORDER BY created_at, id
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(query.pattern())
        .bind(query.limit())
        .bind(query.offset())
        .fetch(db);

        let mut records = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            records.push(res);
        }

        Ok(records)
    }

    pub async fn count(db: &mut SqliteConnection, query: &ListQuery) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM hl7_in_error
            WHERE ($1 IS NULL OR payload LIKE $1 OR source_key LIKE $1 OR error_summary LIKE $1)
            ",
        )
        .bind(query.pattern())
        .fetch_one(db)
        .await?)
    }
}
