//! Worker pool: bounded-concurrency consumer over the event queue.
//!
//! A fixed number of worker loops pull from one shared pgmq queue. Loops wake
//! on Postgres NOTIFY with a polling fallback, and a pool-wide token bucket
//! caps throughput. Failed jobs are retried with exponential backoff by
//! pushing the message's visibility timeout out; a job that reaches the
//! attempt cap is handed to the dead-letter handler and archived so it is
//! never redelivered.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::db::queue::{QueueMessage, TASK_EVENTS_QUEUE, WAKE_CHANNEL};
use crate::db::Db;
use crate::deadletter::DeadLetterHandler;
use crate::error::Result;
use crate::model::job::{DeadLetter, Job};
use crate::model::task::Status;
use crate::service::TaskService;
use crate::shutdown::Shutdown;
use crate::telemetry::job::{record_job_outcome, start_job_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff for failed jobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Total attempts before a job is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry, given the number of attempts already
    /// made: base_delay * multiplier^(attempts - 1).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Pool-wide throughput cap. One bucket is shared by every worker loop, so
/// the limit holds across the pool rather than per worker. Single-process
/// state: a multi-instance deployment would need a shared external counter.
struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            rate_per_sec: rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: tokio::time::Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker loops, i.e. maximum jobs in flight.
    pub max_concurrent: usize,
    /// Pool-wide throughput cap in jobs per second.
    pub rate_limit_per_sec: u32,
    /// Visibility timeout (seconds) for queue reads. A claimed job abandoned
    /// mid-processing becomes eligible for redelivery after this long.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            rate_limit_per_sec: 100,
            visibility_timeout: 30,
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// The worker pool: listen for jobs, dispatch by kind, retire or retry.
pub struct WorkerPool {
    db: Arc<Db>,
    service: Arc<TaskService>,
    dead_letters: DeadLetterHandler,
    config: WorkerConfig,
    limiter: Arc<TokenBucket>,
    wake: Arc<Notify>,
    shutdown: Arc<Shutdown>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            service: Arc::clone(&self.service),
            dead_letters: self.dead_letters.clone(),
            config: self.config.clone(),
            limiter: Arc::clone(&self.limiter),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl WorkerPool {
    pub fn new(
        db: Arc<Db>,
        service: Arc<TaskService>,
        dead_letters: DeadLetterHandler,
        config: WorkerConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.rate_limit_per_sec));
        Self {
            db,
            service,
            dead_letters,
            config,
            limiter,
            wake: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Run the pool until shutdown: one NOTIFY listener plus
    /// `max_concurrent` worker loops over the shared queue.
    pub async fn run(&self) -> Result<()> {
        info!(workers = self.config.max_concurrent, "worker pool started");

        let mut set = JoinSet::new();

        let listener = self.clone();
        set.spawn(async move { listener.listen_loop().await });

        for worker_id in 0..self.config.max_concurrent {
            let worker = self.clone();
            set.spawn(async move { worker.worker_loop(worker_id).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("worker task panicked: {e}");
            }
        }

        info!("worker pool stopped");
        Ok(())
    }

    /// Forward Postgres NOTIFY wake-ups to the worker loops, reconnecting on
    /// listener errors. Workers fall back to polling regardless.
    async fn listen_loop(&self) {
        while !self.shutdown.is_triggered() {
            match sqlx::postgres::PgListener::connect_with(self.db.pool()).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(WAKE_CHANNEL).await {
                        warn!("LISTEN failed: {e}, falling back to poll");
                    } else {
                        loop {
                            tokio::select! {
                                _ = self.shutdown.notified() => return,
                                notif = listener.recv() => match notif {
                                    Ok(_) => self.wake.notify_waiters(),
                                    Err(e) => {
                                        warn!("listener error: {e}, reconnecting");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("listener connect failed: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One worker loop: rate-gate, claim, handle. Sleeps on an empty queue
    /// until a wake-up or the poll interval elapses.
    async fn worker_loop(&self, worker_id: usize) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            self.limiter.acquire().await;

            match self
                .db
                .read_message(TASK_EVENTS_QUEUE, self.config.visibility_timeout)
                .await
            {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, "queue read failed: {e}");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// Process one claimed message through parse → dispatch → ack/fail.
    async fn handle_message(&self, msg: QueueMessage) {
        let job: Job = match serde_json::from_value(msg.message.clone()) {
            Ok(job) => job,
            Err(e) => {
                // Malformed payload or unrecognized status: a validation
                // failure, routed through the same retry/dead-letter path.
                self.fail_job(&msg, "invalid", format!("malformed job payload: {e}"))
                    .await;
                return;
            }
        };

        let span = start_job_span(job.kind(), msg.msg_id);
        async {
            let started = std::time::Instant::now();
            let outcome = self.dispatch(&job).await;
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "job.dispatch")],
            );
            match outcome {
                Ok(()) => {
                    record_job_outcome("success");
                    metrics::jobs_processed().add(
                        1,
                        &[
                            KeyValue::new("kind", job.kind()),
                            KeyValue::new("outcome", "success"),
                        ],
                    );
                    if let Err(e) = self.db.archive_message(TASK_EVENTS_QUEUE, msg.msg_id).await {
                        // The job will redeliver after the visibility timeout
                        // and re-apply as a no-op.
                        warn!(msg_id = msg.msg_id, "ack failed, job may redeliver: {e}");
                    }
                }
                Err(e) => self.fail_job(&msg, job.kind(), e.to_string()).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Apply a job by re-invoking the lifecycle service. Redelivery is safe:
    /// setting a status that already matches enqueues nothing.
    async fn dispatch(&self, job: &Job) -> Result<()> {
        match *job {
            Job::StatusUpdate { task_id, status } => {
                self.service.change_status(task_id, status).await?;
            }
            Job::OverdueProcess { task_id } => {
                self.service
                    .change_status(task_id, Status::InProgress)
                    .await?;
            }
        }
        Ok(())
    }

    /// Failure path: retry with backoff below the attempt cap, dead-letter at
    /// it. The original message is archived once dead-lettered so it is never
    /// retried again, even if the hand-off itself failed (which is logged).
    async fn fail_job(&self, msg: &QueueMessage, kind: &'static str, error: String) {
        let attempts = msg.read_ct.max(1);

        if (attempts as u32) < self.config.retry.max_attempts {
            let delay = self.config.retry.next_delay(attempts as u32);
            warn!(
                msg_id = msg.msg_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "job failed, scheduling retry"
            );
            record_job_outcome("retry");
            metrics::jobs_processed().add(
                1,
                &[KeyValue::new("kind", kind), KeyValue::new("outcome", "retry")],
            );
            if let Err(e) = self
                .db
                .delay_message(TASK_EVENTS_QUEUE, msg.msg_id, delay.as_secs().max(1) as i32)
                .await
            {
                // The claim's own visibility timeout still redelivers it.
                warn!(msg_id = msg.msg_id, "backoff reschedule failed: {e}");
            }
            return;
        }

        let record = DeadLetter {
            queue_name: TASK_EVENTS_QUEUE.to_string(),
            job_id: msg.msg_id,
            payload: msg.message.clone(),
            error,
            attempts,
            failed_at: Utc::now(),
        };

        if let Err(e) = self.dead_letters.record(&record).await {
            error!(
                msg_id = msg.msg_id,
                "dead-letter hand-off failed, dropping job: {e}"
            );
        }
        record_job_outcome("dead_letter");
        metrics::jobs_dead_lettered().add(1, &[KeyValue::new("kind", kind)]);

        if let Err(e) = self.db.archive_message(TASK_EVENTS_QUEUE, msg.msg_id).await {
            error!(msg_id = msg.msg_id, "failed to archive dead-lettered job: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn default_policy_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_caps_throughput() {
        let bucket = TokenBucket::new(10);

        // Burst capacity drains without waiting.
        for _ in 0..10 {
            bucket.acquire().await;
        }

        // The next token requires ~100ms of refill; paused time makes the
        // sleep deterministic.
        let start = tokio::time::Instant::now();
        bucket.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    }
}
