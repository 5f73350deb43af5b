//! Task lifecycle service.
//!
//! Orchestrates task-store writes and event-queue sends inside one database
//! transaction, and owns cache consistency: every write path invalidates the
//! task's own entity key, all list keys, and the stats key within the same
//! logical operation.
//!
//! Error policy: write paths normalize infrastructure failures (database,
//! serialization) into a generic `OperationFailed`; the cause is logged here,
//! not surfaced. Domain failures (`NotFound`, `Unauthorized`, `Validation`)
//! pass through distinctly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cache::Cache;
use crate::db::{Db, queue, tasks};
use crate::error::{Error, Result};
use crate::model::job::{BatchAction, BatchItemResult, Job};
use crate::model::task::{
    Actor, NewTask, Status, StatusCounts, Task, TaskFilter, TaskId, TaskPatch,
};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const STATS_KEY: &str = "tasks:stats";
const LIST_PREFIX: &str = "tasks:list:";

/// Cached page for filtered list queries.
#[derive(Serialize, Deserialize)]
struct TaskPage {
    tasks: Vec<Task>,
    total: i64,
}

pub struct TaskService {
    db: Arc<Db>,
    cache: Arc<Cache>,
}

impl TaskService {
    pub fn new(db: Arc<Db>, cache: Arc<Cache>) -> Self {
        Self { db, cache }
    }

    // -- write paths --------------------------------------------------------

    /// Create a task. The initial status is recorded directly; only later
    /// status *changes* produce lifecycle events.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = async {
            let mut tx = self.db.pool().begin().await?;
            let task = tasks::insert_task(&mut *tx, &new).await?;
            tx.commit().await?;
            Ok(task)
        }
        .await
        .map_err(|e| normalize_write("create task", e))?;

        self.invalidate(None).await;
        metrics::tasks_created().add(1, &[]);
        info!(id = %task.id, status = %task.status, "task created");
        Ok(task)
    }

    /// Change a task's status. If the status actually changes, exactly one
    /// `status_update` job is sent on the same transaction as the row write;
    /// both commit or neither does. Setting the current status again is a
    /// no-op event-wise, which is what makes redelivered jobs harmless.
    pub async fn change_status(&self, id: TaskId, status: Status) -> Result<Task> {
        let (task, prior) = async {
            let mut tx = self.db.pool().begin().await?;
            let current = tasks::fetch_task_for_update(&mut *tx, id).await?;
            let prior = current.status;
            let task = tasks::update_status(&mut *tx, id, status).await?;

            if status != prior {
                let job = serde_json::to_value(Job::StatusUpdate { task_id: id, status })?;
                queue::send(&mut *tx, queue::TASK_EVENTS_QUEUE, &job).await?;
                queue::notify_workers(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok((task, prior))
        }
        .await
        .map_err(|e| normalize_write("change status", e))?;

        self.invalidate(Some(id)).await;
        if status != prior {
            metrics::task_status_transitions().add(
                1,
                &[
                    KeyValue::new("from", prior.to_string()),
                    KeyValue::new("to", status.to_string()),
                ],
            );
            info!(%id, from = %prior, to = %status, "task status changed");
        }
        Ok(task)
    }

    /// Apply a partial update to a task's non-status fields.
    pub async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<Task> {
        let task = async {
            let mut tx = self.db.pool().begin().await?;
            let task = tasks::update_task(&mut *tx, id, &patch).await?;
            tx.commit().await?;
            Ok(task)
        }
        .await
        .map_err(|e| normalize_write("update task", e))?;

        self.invalidate(Some(id)).await;
        Ok(task)
    }

    /// Delete a task. Deletion produces no lifecycle event.
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        async {
            let mut tx = self.db.pool().begin().await?;
            tasks::delete_task(&mut *tx, id).await?;
            tx.commit().await?;
            Ok(())
        }
        .await
        .map_err(|e| normalize_write("delete task", e))?;

        self.invalidate(Some(id)).await;
        info!(%id, "task deleted");
        Ok(())
    }

    /// Apply `action` to each task in `ids` under one outer transaction.
    ///
    /// Per-item failures (unknown action, not found, actor lacks rights)
    /// land in that item's result without aborting siblings. Only an
    /// infrastructure failure (connection, commit) aborts the whole batch and
    /// rolls every item back.
    pub async fn batch_apply(
        &self,
        ids: &[TaskId],
        action: &str,
        actor: &Actor,
    ) -> Result<Vec<BatchItemResult>> {
        let mut results = Vec::with_capacity(ids.len());
        let mut events_sent = false;

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| normalize_write("batch apply", e.into()))?;

        for &id in ids {
            let item = async {
                // Parsed per item: an unknown action fails this item only.
                let action: BatchAction = action.parse()?;
                let task = tasks::fetch_task_for_update(&mut *tx, id).await?;
                if !actor.may_act_on(&task) {
                    return Err(Error::Unauthorized(format!(
                        "actor {} may not modify task {id}",
                        actor.id
                    )));
                }

                match action {
                    BatchAction::Complete => {
                        let prior = task.status;
                        tasks::update_status(&mut *tx, id, Status::Completed).await?;
                        if prior != Status::Completed {
                            let job = serde_json::to_value(Job::StatusUpdate {
                                task_id: id,
                                status: Status::Completed,
                            })?;
                            queue::send(&mut *tx, queue::TASK_EVENTS_QUEUE, &job).await?;
                            events_sent = true;
                        }
                    }
                    BatchAction::Delete => {
                        tasks::delete_task(&mut *tx, id).await?;
                    }
                }
                Ok(())
            }
            .await;

            match item {
                Ok(()) => results.push(BatchItemResult::ok(id)),
                Err(e @ (Error::NotFound(_) | Error::Unauthorized(_) | Error::Validation(_))) => {
                    results.push(BatchItemResult::failed(id, e.to_string()));
                }
                // Resource-level failure: the transaction is no longer
                // healthy, abort everything.
                Err(e) => return Err(normalize_write("batch apply", e)),
            }
        }

        if events_sent {
            queue::notify_workers(&mut *tx)
                .await
                .map_err(|e| normalize_write("batch apply", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| normalize_write("batch apply", e.into()))?;

        self.invalidate(None).await;
        for r in results.iter().filter(|r| r.success) {
            self.cache.delete(&task_key(r.id)).await;
        }
        Ok(results)
    }

    // -- read paths ---------------------------------------------------------

    /// Fetch a task, read-through cached. `NotFound` is preserved distinctly.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let key = task_key(id);
        if let Some(task) = self.cache.get::<Task>(&key).await {
            return Ok(task);
        }

        let task = self.db.fetch_task(id).await?;
        self.cache.set(&key, &task, self.cache.default_ttl()).await;
        Ok(task)
    }

    /// Filtered, paginated task list plus total match count, cached per
    /// filter combination.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<(Vec<Task>, i64)> {
        let key = list_key(filter);
        if let Some(page) = self.cache.get::<TaskPage>(&key).await {
            return Ok((page.tasks, page.total));
        }

        let (tasks, total) = self.db.query_tasks(filter).await?;
        self.cache
            .set(&key, &TaskPage { tasks: tasks.clone(), total }, self.cache.default_ttl())
            .await;
        Ok((tasks, total))
    }

    /// Aggregate task counts by status.
    pub async fn stats(&self) -> Result<StatusCounts> {
        if let Some(counts) = self.cache.get::<StatusCounts>(STATS_KEY).await {
            return Ok(counts);
        }

        let counts = self.db.count_by_status().await?;
        self.cache
            .set(STATS_KEY, &counts, self.cache.default_ttl())
            .await;
        Ok(counts)
    }

    // -- cache discipline ---------------------------------------------------

    /// Invalidate the caches affected by a task mutation: the entity key when
    /// known, every list key (membership depends on filters that cannot be
    /// targeted selectively), and the stats key.
    async fn invalidate(&self, id: Option<TaskId>) {
        if let Some(id) = id {
            self.cache.delete(&task_key(id)).await;
        }
        self.cache.delete_prefix(LIST_PREFIX).await;
        self.cache.delete(STATS_KEY).await;
    }
}

fn task_key(id: TaskId) -> String {
    format!("task:id:{id}")
}

fn list_key(filter: &TaskFilter) -> String {
    let status = filter
        .status
        .map_or_else(|| "all".to_string(), |s| s.to_string());
    let priority = filter
        .priority
        .map_or_else(|| "all".to_string(), |p| p.to_string());
    format!(
        "{LIST_PREFIX}{status}:{priority}:{}:{}",
        filter.page(),
        filter.limit()
    )
}

/// Log the real cause, hand the caller a generic failure. Domain errors pass
/// through untouched.
fn normalize_write(op: &str, e: Error) -> Error {
    match e {
        Error::NotFound(_) | Error::Unauthorized(_) | Error::Validation(_) => e,
        other => {
            error!("{op} failed: {other}");
            Error::OperationFailed(op.to_string())
        }
    }
}
