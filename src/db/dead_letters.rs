//! Dead-letter table operations. Append-only.

use uuid::Uuid;

use crate::error::Result;
use crate::model::job::DeadLetter;

impl super::Db {
    /// Append a dead-letter record.
    pub async fn insert_dead_letter(&self, record: &DeadLetter) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters (id, queue_name, job_id, payload, error, attempts, failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(&record.queue_name)
        .bind(record.job_id)
        .bind(&record.payload)
        .bind(&record.error)
        .bind(record.attempts)
        .bind(record.failed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Most recent dead letters, newest first.
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows: Vec<(String, i64, serde_json::Value, String, i32, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as(
                "SELECT queue_name, job_id, payload, error, attempts, failed_at
                 FROM dead_letters ORDER BY failed_at DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(queue_name, job_id, payload, error, attempts, failed_at)| DeadLetter {
                    queue_name,
                    job_id,
                    payload,
                    error,
                    attempts,
                    failed_at,
                },
            )
            .collect())
    }
}
