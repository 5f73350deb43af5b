//! Dead-letter handler: terminal sink for jobs that exhausted their retries.
//!
//! Records are appended to the `dead_letters` table and never reprocessed. A
//! failure to record must not throw back into the worker's retry path; the
//! worker logs it and moves on.

use std::sync::Arc;

use tracing::info;

use crate::db::Db;
use crate::error::Result;
use crate::model::job::DeadLetter;

#[derive(Clone)]
pub struct DeadLetterHandler {
    db: Arc<Db>,
}

impl DeadLetterHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Durably persist a dead-letter record.
    pub async fn record(&self, record: &DeadLetter) -> Result<()> {
        self.db.insert_dead_letter(record).await?;
        info!(
            job_id = record.job_id,
            attempts = record.attempts,
            error = %record.error,
            "job dead-lettered"
        );
        Ok(())
    }

    /// Most recent records, newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        self.db.list_dead_letters(limit).await
    }
}
