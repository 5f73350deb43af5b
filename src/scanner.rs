//! Overdue scanner: time-triggered batch producer.
//!
//! Finds tasks whose due date has passed while still pending and bulk-enqueues
//! one `overdue_process` job per task. The cutoff timestamp is captured once
//! per pass and reused for every batch, so concurrent writes cannot shift the
//! result set mid-scan; ordering is stable for the same reason. Duplicate
//! delivery is tolerated downstream (idempotent consumers).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::db::{Db, queue};
use crate::error::Result;
use crate::model::job::Job;
use crate::model::task::Status;
use crate::shutdown::Shutdown;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Rows fetched and enqueued per batch.
    pub batch_size: i64,
    /// Time between scan passes.
    pub interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(3600),
        }
    }
}

pub struct OverdueScanner {
    db: Arc<Db>,
    config: ScannerConfig,
}

impl OverdueScanner {
    pub fn new(db: Arc<Db>, config: ScannerConfig) -> Self {
        Self { db, config }
    }

    /// One scan pass. Returns the number of jobs enqueued.
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = Utc::now();

        let total = self.db.count_overdue(cutoff, Status::Pending).await?;
        if total == 0 {
            debug!("no overdue tasks");
            return Ok(0);
        }

        info!(total, "overdue scan started");
        let mut enqueued: u64 = 0;
        let mut offset: i64 = 0;

        loop {
            let batch = self
                .db
                .list_overdue(cutoff, Status::Pending, offset, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let payloads = batch
                .iter()
                .map(|t| serde_json::to_value(Job::OverdueProcess { task_id: t.id }))
                .collect::<std::result::Result<Vec<_>, serde_json::Error>>()?;

            self.db
                .send_batch(queue::TASK_EVENTS_QUEUE, &payloads)
                .await?;
            self.db.wake_workers().await?;

            enqueued += batch.len() as u64;
            offset += batch.len() as i64;
            if (batch.len() as i64) < self.config.batch_size {
                break;
            }
        }

        metrics::overdue_enqueued().add(enqueued, &[]);
        info!(enqueued, "overdue scan finished");
        Ok(enqueued)
    }

    /// Run scan passes on a fixed schedule until shutdown. The first pass
    /// runs immediately at startup.
    pub async fn run(&self, shutdown: Arc<Shutdown>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("overdue scanner shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("overdue scan failed: {e}");
                    }
                }
            }
        }
    }
}
