//! tasktrack CLI: operator interface to the task-tracking service.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use uuid::Uuid;

use tasktrack_rs::cache::Cache;
use tasktrack_rs::config::Config;
use tasktrack_rs::db::{Db, queue};
use tasktrack_rs::deadletter::DeadLetterHandler;
use tasktrack_rs::model::task::{
    Actor, NewTask, Priority, Role, Status, TaskFilter, TaskId, TaskPatch,
};
use tasktrack_rs::scanner::{OverdueScanner, ScannerConfig};
use tasktrack_rs::service::TaskService;
use tasktrack_rs::shutdown::Shutdown;
use tasktrack_rs::telemetry::{TelemetryConfig, init_telemetry};
use tasktrack_rs::worker::{WorkerConfig, WorkerPool};

#[derive(Parser)]
#[command(name = "tasktrack", about = "Task-tracking lifecycle pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool and overdue scanner
    Serve {
        /// Maximum concurrent jobs
        #[arg(long, default_value_t = 10)]
        max_concurrent: usize,
        /// Pool-wide throughput cap, jobs per second
        #[arg(long, default_value_t = 100)]
        rate_limit: u32,
        /// Seconds between overdue scan passes
        #[arg(long, default_value_t = 3600)]
        scan_interval: u64,
    },
    /// Run one overdue scan pass and exit
    Scan,
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Show recent dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show task counts by status
    Stats,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a new task
    Create {
        title: String,
        /// Owning user ID
        #[arg(long)]
        owner: Uuid,
        #[arg(long, default_value = "")]
        description: String,
        /// low | medium | high
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Due date, RFC 3339 (e.g. 2026-09-01T12:00:00Z)
        #[arg(long)]
        due: Option<DateTime<Utc>>,
    },
    /// Show a task
    Show { id: Uuid },
    /// List tasks
    List {
        /// Filter by status (pending | in_progress | completed)
        #[arg(long)]
        status: Option<String>,
        /// Filter by priority (low | medium | high)
        #[arg(long)]
        priority: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Update a task's title, description, priority, or due date
    Update {
        id: Uuid,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// low | medium | high
        #[arg(long)]
        priority: Option<String>,
        /// Due date, RFC 3339; use --clear-due to remove instead
        #[arg(long)]
        due: Option<DateTime<Utc>>,
        #[arg(long)]
        clear_due: bool,
    },
    /// Change a task's status
    SetStatus {
        id: Uuid,
        /// pending | in_progress | completed
        status: String,
    },
    /// Delete a task
    Delete { id: Uuid },
    /// Apply one action to many tasks
    Batch {
        /// complete | delete
        action: String,
        /// Task IDs
        ids: Vec<Uuid>,
        /// Acting user ID
        #[arg(long)]
        actor: Uuid,
        /// Act with admin rights (skip ownership checks)
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            max_concurrent,
            rate_limit,
            scan_interval,
        } => cmd_serve(max_concurrent, rate_limit, scan_interval).await,
        command => {
            let config = Config::from_env()?;
            let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
            db.migrate().await?;
            db.create_queue(queue::TASK_EVENTS_QUEUE).await?;
            let cache = Arc::new(Cache::new(config.cache_ttl));
            let service = TaskService::new(Arc::clone(&db), cache);

            match command {
                Command::Scan => {
                    let scanner = OverdueScanner::new(db, ScannerConfig::default());
                    let enqueued = scanner.run_once().await?;
                    println!("{enqueued} overdue job(s) enqueued");
                    Ok(())
                }
                Command::Task { action } => cmd_task(&service, action).await,
                Command::DeadLetters { limit } => {
                    let handler = DeadLetterHandler::new(db);
                    cmd_dead_letters(&handler, limit).await
                }
                Command::Stats => {
                    let counts = service.stats().await?;
                    println!("pending:      {}", counts.pending);
                    println!("in_progress:  {}", counts.in_progress);
                    println!("completed:    {}", counts.completed);
                    println!("total:        {}", counts.total());
                    Ok(())
                }
                Command::Serve { .. } => unreachable!(),
            }
        }
    }
}

async fn cmd_serve(max_concurrent: usize, rate_limit: u32, scan_interval: u64) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tasktrack".to_string(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;
    db.create_queue(queue::TASK_EVENTS_QUEUE).await?;

    let cache = Arc::new(Cache::new(config.cache_ttl));
    let service = Arc::new(TaskService::new(Arc::clone(&db), cache));
    let dead_letters = DeadLetterHandler::new(Arc::clone(&db));

    let shutdown = Shutdown::new();
    let pool = WorkerPool::new(
        Arc::clone(&db),
        service,
        dead_letters,
        WorkerConfig {
            max_concurrent,
            rate_limit_per_sec: rate_limit,
            ..WorkerConfig::default()
        },
        Arc::clone(&shutdown),
    );
    let scanner = OverdueScanner::new(
        Arc::clone(&db),
        ScannerConfig {
            interval: Duration::from_secs(scan_interval),
            ..ScannerConfig::default()
        },
    );

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.trigger();
    });

    let scan_shutdown = Arc::clone(&shutdown);
    let scan_handle = tokio::spawn(async move { scanner.run(scan_shutdown).await });

    pool.run().await?;
    scan_handle.await.ok();
    Ok(())
}

async fn cmd_task(service: &TaskService, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Create {
            title,
            owner,
            description,
            priority,
            due,
        } => {
            let mut new = NewTask::new(title, owner)
                .description(description)
                .priority(priority.parse::<Priority>()?);
            if let Some(due) = due {
                new = new.due_date(due);
            }
            let task = service.create_task(new).await?;
            println!("Created: {} (status: {})", task.id, task.status);
        }
        TaskAction::Show { id } => {
            let task = service.get_task(TaskId(id)).await?;
            println!("ID:          {}", task.id);
            println!("Title:       {}", task.title);
            if !task.description.is_empty() {
                println!("Description: {}", task.description);
            }
            println!("Status:      {}", task.status);
            println!("Priority:    {}", task.priority);
            println!(
                "Due:         {}",
                task.due_date
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("Owner:       {}", task.owner_id);
            println!("Created:     {}", task.created_at);
            println!("Updated:     {}", task.updated_at);
        }
        TaskAction::List {
            status,
            priority,
            page,
            limit,
        } => {
            let filter = TaskFilter {
                status: status.map(|s| s.parse::<Status>()).transpose()?,
                priority: priority.map(|p| p.parse::<Priority>()).transpose()?,
                page,
                limit,
            };
            let (tasks, total) = service.list_tasks(&filter).await?;

            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }

            println!(
                "{:<36}  {:<12}  {:<8}  {:<25}  TITLE",
                "ID", "STATUS", "PRI", "DUE"
            );
            println!("{}", "-".repeat(110));
            for task in &tasks {
                let due = task
                    .due_date
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36}  {:<12}  {:<8}  {:<25}  {}",
                    task.id, task.status, task.priority, due, task.title
                );
            }
            println!("\n{} of {} task(s)", tasks.len(), total);
        }
        TaskAction::Update {
            id,
            title,
            description,
            priority,
            due,
            clear_due,
        } => {
            let patch = TaskPatch {
                title,
                description,
                priority: priority.map(|p| p.parse::<Priority>()).transpose()?,
                due_date: if clear_due { Some(None) } else { due.map(Some) },
            };
            let task = service.update_task(TaskId(id), patch).await?;
            println!("Updated: {}", task.id);
        }
        TaskAction::SetStatus { id, status } => {
            let task = service
                .change_status(TaskId(id), status.parse::<Status>()?)
                .await?;
            println!("Updated: {} (status: {})", task.id, task.status);
        }
        TaskAction::Delete { id } => {
            service.delete_task(TaskId(id)).await?;
            println!("Deleted: {id}");
        }
        TaskAction::Batch {
            action,
            ids,
            actor,
            admin,
        } => {
            let actor = Actor {
                id: actor,
                role: if admin { Role::Admin } else { Role::User },
            };
            let ids: Vec<TaskId> = ids.into_iter().map(TaskId).collect();
            let results = service.batch_apply(&ids, &action, &actor).await?;

            for r in &results {
                match &r.error {
                    None => println!("{}: ok", r.id),
                    Some(e) => println!("{}: FAILED: {e}", r.id),
                }
            }
            let failed = results.iter().filter(|r| !r.success).count();
            println!("\n{} applied, {} failed", results.len() - failed, failed);
        }
    }
    Ok(())
}

async fn cmd_dead_letters(handler: &DeadLetterHandler, limit: i64) -> anyhow::Result<()> {
    let records = handler.list(limit).await?;

    if records.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    for record in &records {
        println!(
            "[{}] job {} ({} attempts): {}",
            record.failed_at.format("%Y-%m-%d %H:%M:%S"),
            record.job_id,
            record.attempts,
            record.error
        );
        println!("    payload: {}", record.payload);
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}
