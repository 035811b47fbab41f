use chrono::Utc;
use sqlx::SqliteConnection;

use crate::{error::Error, message::Source};

impl Source {
    pub async fn insert(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        description: Option<&str>,
    ) -> Result<Source, Error> {
        Ok(sqlx::query_as(
            "
            INSERT INTO hl7_sources (name, description, created_at)
            VALUES ($1, $2, $3)
            RETURNING *
            ",
        )
        .bind(name.as_ref())
        .bind(description)
        .bind(Utc::now())
        .fetch_one(db)
        .await?)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<Source>, Error> {
        Ok(sqlx::query_as("SELECT * FROM hl7_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    pub async fn get_by_name(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
    ) -> Result<Option<Source>, Error> {
        Ok(sqlx::query_as("SELECT * FROM hl7_sources WHERE name = $1")
            .bind(name.as_ref())
            .fetch_optional(db)
            .await?)
    }

    pub async fn list(db: &mut SqliteConnection) -> Result<Vec<Source>, Error> {
        Ok(sqlx::query_as("SELECT * FROM hl7_sources ORDER BY name")
            .fetch_all(db)
            .await?)
    }

    pub async fn retire(
        db: &mut SqliteConnection,
        id: i64,
        reason: Option<&str>,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE hl7_sources
            SET retired = TRUE, retire_reason = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(reason)
        .execute(db)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Whether any queue item in any collection still points at the source.
    pub async fn is_referenced(db: &mut SqliteConnection, id: i64) -> Result<bool, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT EXISTS (SELECT 1 FROM hl7_in_queue WHERE source_id = $1)
                OR EXISTS (SELECT 1 FROM hl7_in_archive WHERE source_id = $1)
                OR EXISTS (SELECT 1 FROM hl7_in_error WHERE source_id = $1)
            ",
        )
        .bind(id)
        .fetch_one(db)
        .await?)
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM hl7_sources WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(res.rows_affected() > 0)
    }
}
