//! Task row operations.
//!
//! Mutating functions take `&mut PgConnection` so they execute on whatever
//! transaction the caller (the lifecycle service) has open: a task write and
//! its event enqueue commit or roll back together. Reads go straight to the
//! pool.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::task::{NewTask, StatusCounts, Task, TaskFilter, TaskId, TaskPatch, Status};

impl super::Db {
    /// Fetch a task by ID.
    pub async fn fetch_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, title, description, status, priority, due_date, owner_id, created_at, updated_at
             FROM tasks WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    /// Query tasks with filters and pagination. Returns the page plus the
    /// total match count, newest first.
    pub async fn query_tasks(&self, filter: &TaskFilter) -> Result<(Vec<Task>, i64)> {
        let status = filter.status.map(|s| s.to_string());
        let priority = filter.priority.map(|p| p.to_string());

        let total: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR priority = $2)",
        )
        .bind(&status)
        .bind(&priority)
        .fetch_one(self.pool())
        .await?;

        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, title, description, status, priority, due_date, owner_id, created_at, updated_at
             FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR priority = $2)
             ORDER BY created_at DESC, id
             LIMIT $3 OFFSET $4",
        )
        .bind(&status)
        .bind(&priority)
        .bind(i64::from(filter.limit()))
        .bind(filter.offset())
        .fetch_all(self.pool())
        .await?;

        let tasks = rows
            .into_iter()
            .map(TaskRow::try_into_task)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, total.0))
    }

    /// Count tasks in `status` whose due date lies before `before`.
    pub async fn count_overdue(&self, before: DateTime<Utc>, status: Status) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM tasks WHERE due_date < $1 AND status = $2",
        )
        .bind(before)
        .bind(status.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Page through overdue tasks with stable ordering, so concurrent writes
    /// don't reshuffle rows between batches of one scan pass.
    pub async fn list_overdue(
        &self,
        before: DateTime<Utc>,
        status: Status,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, title, description, status, priority, due_date, owner_id, created_at, updated_at
             FROM tasks
             WHERE due_date < $1 AND status = $2
             ORDER BY due_date, id
             LIMIT $3 OFFSET $4",
        )
        .bind(before)
        .bind(status.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Task counts by status, for the stats read model.
    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM tasks GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<Status>()? {
                Status::Pending => counts.pending = n,
                Status::InProgress => counts.in_progress = n,
                Status::Completed => counts.completed = n,
            }
        }
        Ok(counts)
    }
}

/// Insert a new task row on the caller's transaction.
pub async fn insert_task(conn: &mut PgConnection, new: &NewTask) -> Result<Task> {
    let id = TaskId::new();
    let now = Utc::now();

    let row: TaskRow = sqlx::query_as(
        "INSERT INTO tasks (id, title, description, status, priority, due_date, owner_id, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
         RETURNING id, title, description, status, priority, due_date, owner_id, created_at, updated_at",
    )
    .bind(id.0)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.status.to_string())
    .bind(new.priority.to_string())
    .bind(new.due_date)
    .bind(new.owner_id)
    .bind(now)
    .fetch_one(conn)
    .await?;

    row.try_into_task()
}

/// Fetch a task row on the caller's transaction, locked for update. The row
/// lock is the only serialization point between concurrent writers.
pub async fn fetch_task_for_update(conn: &mut PgConnection, id: TaskId) -> Result<Task> {
    let row: Option<TaskRow> = sqlx::query_as(
        "SELECT id, title, description, status, priority, due_date, owner_id, created_at, updated_at
         FROM tasks WHERE id = $1 FOR UPDATE",
    )
    .bind(id.0)
    .fetch_optional(conn)
    .await?;

    row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
        .try_into_task()
}

/// Set a task's status on the caller's transaction.
pub async fn update_status(conn: &mut PgConnection, id: TaskId, status: Status) -> Result<Task> {
    let row: Option<TaskRow> = sqlx::query_as(
        "UPDATE tasks SET status = $1, updated_at = $2 WHERE id = $3
         RETURNING id, title, description, status, priority, due_date, owner_id, created_at, updated_at",
    )
    .bind(status.to_string())
    .bind(Utc::now())
    .bind(id.0)
    .fetch_optional(conn)
    .await?;

    row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
        .try_into_task()
}

/// Apply a partial update on the caller's transaction.
pub async fn update_task(conn: &mut PgConnection, id: TaskId, patch: &TaskPatch) -> Result<Task> {
    let current = fetch_task_for_update(&mut *conn, id).await?;

    let title = patch.title.clone().unwrap_or(current.title);
    let description = patch.description.clone().unwrap_or(current.description);
    let priority = patch.priority.unwrap_or(current.priority);
    let due_date = patch.due_date.unwrap_or(current.due_date);

    let row: TaskRow = sqlx::query_as(
        "UPDATE tasks SET title = $1, description = $2, priority = $3, due_date = $4, updated_at = $5
         WHERE id = $6
         RETURNING id, title, description, status, priority, due_date, owner_id, created_at, updated_at",
    )
    .bind(&title)
    .bind(&description)
    .bind(priority.to_string())
    .bind(due_date)
    .bind(Utc::now())
    .bind(id.0)
    .fetch_one(conn)
    .await?;

    row.try_into_task()
}

/// Delete a task row on the caller's transaction.
pub async fn delete_task(conn: &mut PgConnection, id: TaskId) -> Result<()> {
    let affected = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id.0)
        .execute(conn)
        .await?
        .rows_affected();

    if affected == 0 {
        return Err(Error::NotFound(format!("task {id}")));
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    title: String,
    description: String,
    status: String,
    priority: String,
    due_date: Option<DateTime<Utc>>,
    owner_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            title: self.title,
            description: self.description,
            status: self.status.parse()?,
            priority: self.priority.parse()?,
            due_date: self.due_date,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
