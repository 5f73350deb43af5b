//! Event queue operations via pgmq and direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.send_batch,
//! pgmq.read, pgmq.set_vt, pgmq.archive, pgmq.delete. The queue lives in the
//! same database as the task rows, so `send` is executor-parameterized and can
//! join the caller's transaction.

use sqlx::PgConnection;

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Queue carrying lifecycle jobs.
pub const TASK_EVENTS_QUEUE: &str = "task_events";

/// NOTIFY channel that wakes worker loops. Notifications are transactional:
/// they only fire on commit.
pub const WAKE_CHANNEL: &str = "task_events_ready";

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    /// Delivery count, incremented by pgmq on every read. Doubles as the
    /// attempt counter for retry accounting.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "create");
        Ok(())
    }

    /// Send a batch of messages in one round trip. Returns the message IDs.
    pub async fn send_batch(
        &self,
        queue_name: &str,
        payloads: &[serde_json::Value],
    ) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT pgmq.send_batch($1, $2::jsonb[], 0)")
            .bind(queue_name)
            .bind(payloads)
            .fetch_all(self.pool())
            .await?;
        metrics::queue_operations().add(
            ids.len() as u64,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "send"),
            ],
        );
        Ok(ids)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if the queue is empty.
    pub async fn read_message(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<QueueMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)"
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| QueueMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Push a claimed message's redelivery time out by `vt_seconds`. Used by
    /// the worker to apply retry backoff without re-sending the message.
    pub async fn delay_message(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "set_vt");
        Ok(())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "archive");
        Ok(())
    }

    /// Wake worker loops from outside a transaction (used by the scanner
    /// after a pool-side bulk send).
    pub async fn wake_workers(&self) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(WAKE_CHANNEL)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "delete");
        Ok(())
    }
}

/// Send a message on the caller's transaction. Returns the message ID.
/// The message becomes visible only when the transaction commits.
pub async fn send(
    conn: &mut PgConnection,
    queue_name: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
        .bind(queue_name)
        .bind(payload)
        .fetch_one(conn)
        .await?;
    record_op(queue_name, "send");
    Ok(row.0)
}

/// Wake worker loops after commit. NOTIFY is transactional, so a rolled-back
/// enqueue never produces a spurious wake-up with a visible message.
pub async fn notify_workers(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(WAKE_CHANNEL)
        .execute(conn)
        .await?;
    Ok(())
}

fn record_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
