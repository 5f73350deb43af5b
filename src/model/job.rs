//! Lifecycle jobs and batch operations.
//!
//! A job is a message describing a required task-state transition, carried as
//! JSON in a pgmq message. Delivery is at-least-once: handlers must tolerate
//! redelivery, so applying a `status_update` to an already-matching task is a
//! no-op in effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Status, TaskId};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A lifecycle event placed on the event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Apply a status change to a task. Enqueued by the lifecycle service
    /// whenever a status actually changes.
    StatusUpdate { task_id: TaskId, status: Status },

    /// Move an overdue pending task along. Enqueued by the overdue scanner.
    OverdueProcess { task_id: TaskId },
}

impl Job {
    /// Label for spans and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::StatusUpdate { .. } => "status_update",
            Job::OverdueProcess { .. } => "overdue_process",
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Job::StatusUpdate { task_id, .. } | Job::OverdueProcess { task_id } => *task_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letter
// ---------------------------------------------------------------------------

/// Record of a job that exhausted its retry budget. Append-only; created by
/// the worker at the attempt cap and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the job was consumed from.
    pub queue_name: String,
    /// pgmq message id of the original job.
    pub job_id: i64,
    /// Original payload, verbatim. Kept as raw JSON so malformed payloads
    /// (which also dead-letter) survive intact.
    pub payload: serde_json::Value,
    pub error: String,
    /// Attempt count at the time of the terminal failure.
    pub attempts: i32,
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Batch operations
// ---------------------------------------------------------------------------

/// Action applied by `batch_apply`. Parsed per item so an unknown action
/// string fails that item's result instead of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Complete,
    Delete,
}

impl std::str::FromStr for BatchAction {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(BatchAction::Complete),
            "delete" => Ok(BatchAction::Delete),
            other => Err(crate::error::Error::Validation(format!(
                "unknown action: {other}"
            ))),
        }
    }
}

/// Per-item outcome of a batch operation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub id: TaskId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResult {
    pub fn ok(id: TaskId) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: TaskId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
        }
    }
}
