use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEVICE_COMMANDS: &str = "device_commands";
pub const OUTBOUND_MESSAGES: &str = "outbound_messages";
pub const WEBHOOK_DISPATCH: &str = "webhook_dispatch";

/// One durable job. `attempt` counts completed handler runs; a job enqueued
/// fresh carries 0 and a job on its final run carries `max_attempts - 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: JsonValue,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub enqueued_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: 1000,
        }
    }
}

/// Explicit handler result; the runtime derives the retry policy from the
/// variant, never from panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ok,
    /// Retryable failure. Re-run after backoff until attempts are exhausted.
    Retry(String),
    /// Permanent failure already reflected in the owning row; never re-run.
    Terminal(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;

    /// Invoked once, after the final retryable failure, before the job moves
    /// to the dead-letter list.
    async fn on_exhausted(&self, _job: &Job, _reason: &str) {}
}

/// What the runtime does with a job after a retryable failure.
#[derive(Debug, PartialEq)]
enum FailurePlan {
    RetryIn(Duration),
    Exhausted,
}

fn plan_failure(job: &Job) -> FailurePlan {
    let next_attempt = job.attempt + 1;
    if next_attempt < job.max_attempts {
        FailurePlan::RetryIn(backoff_delay(job.backoff_base_ms, next_attempt))
    } else {
        FailurePlan::Exhausted
    }
}

/// Exponential backoff: `base * 2^attempt`.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(20));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Three named queues over one shared broker connection. Layout per queue:
/// a ready list (`wagate:queue:<name>`), a delayed sorted set scored by
/// ready-at epoch ms, and a dead-letter list.
#[derive(Clone)]
pub struct QueueRuntime {
    conn: ConnectionManager,
}

impl QueueRuntime {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Queue(format!("Invalid REDIS_URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to connect to Redis: {}", e)))?;
        Ok(Self { conn })
    }

    fn ready_key(queue: &str) -> String {
        format!("wagate:queue:{}", queue)
    }

    fn delayed_key(queue: &str) -> String {
        format!("wagate:queue:{}:delayed", queue)
    }

    fn dlq_key(queue: &str) -> String {
        format!("wagate:queue:{}:dlq", queue)
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: JsonValue,
        opts: JobOptions,
    ) -> Result<Job, AppError> {
        let job = Job {
            id: Uuid::new_v4(),
            name: name.to_string(),
            payload,
            attempt: 0,
            max_attempts: opts.max_attempts.max(1),
            backoff_base_ms: opts.backoff_base_ms,
            enqueued_at_ms: Utc::now().timestamp_millis(),
        };

        self.push_ready(queue, &job).await?;
        Ok(job)
    }

    async fn push_ready(&self, queue: &str, job: &Job) -> Result<(), AppError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(Self::ready_key(queue))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn schedule_delayed(&self, queue: &str, job: &Job, delay: Duration) -> Result<(), AppError> {
        let raw = serde_json::to_string(job)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(Self::delayed_key(queue))
            .arg(ready_at)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_dlq(&self, queue: &str, job: &Job) -> Result<(), AppError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(Self::dlq_key(queue))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Start the consumer for one queue: a promoter moving due delayed jobs
    /// onto the ready list, plus a pop loop bounded by a semaphore so at most
    /// `concurrency` handlers run at once.
    pub fn spawn_consumer(
        &self,
        queue: &'static str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> JoinHandle<()> {
        let runtime = self.clone();

        tokio::spawn(async move {
            let promoter = {
                let runtime = runtime.clone();
                tokio::spawn(async move { runtime.promote_loop(queue).await })
            };

            runtime.consume_loop(queue, concurrency, handler).await;
            promoter.abort();
        })
    }

    /// Atomically move due delayed jobs onto the ready list. One round trip,
    /// safe against concurrent promoters on other workers.
    async fn promote_loop(&self, queue: &'static str) {
        let script = Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, 100)
            for i, job in ipairs(due) do
                redis.call('ZREM', KEYS[1], job)
                redis.call('LPUSH', KEYS[2], job)
            end
            return #due
            "#,
        );

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let mut conn = self.conn.clone();
            let now = Utc::now().timestamp_millis();
            let result: Result<i64, _> = script
                .key(Self::delayed_key(queue))
                .key(Self::ready_key(queue))
                .arg(now)
                .invoke_async(&mut conn)
                .await;

            match result {
                Ok(promoted) if promoted > 0 => {
                    log::debug!("Promoted {} delayed jobs on queue {}", promoted, queue);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Delayed-job promotion failed on queue {}: {}", queue, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn consume_loop(
        &self,
        queue: &'static str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("queue semaphore closed");

            let mut conn = self.conn.clone();
            let popped: Result<Option<(String, String)>, _> = redis::cmd("BRPOP")
                .arg(Self::ready_key(queue))
                .arg(5)
                .query_async(&mut conn)
                .await;

            let raw = match popped {
                Ok(Some((_, raw))) => raw,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("BRPOP failed on queue {}: {}", queue, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            let job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    log::error!("Dropping undecodable job on queue {}: {}", queue, e);
                    continue;
                }
            };

            let runtime = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                runtime.run_job(queue, job, handler).await;
                drop(permit);
            });
        }
    }

    async fn run_job(&self, queue: &'static str, job: Job, handler: Arc<dyn JobHandler>) {
        let outcome = handler.handle(&job).await;

        match outcome {
            JobOutcome::Ok => {
                log::debug!("Job {} ({}) on {} completed", job.id, job.name, queue);
            }
            JobOutcome::Terminal(reason) => {
                log::warn!(
                    "Job {} ({}) on {} failed terminally: {}",
                    job.id,
                    job.name,
                    queue,
                    reason
                );
            }
            JobOutcome::Retry(reason) => match plan_failure(&job) {
                FailurePlan::RetryIn(delay) => {
                    let mut retried = job.clone();
                    retried.attempt += 1;
                    log::warn!(
                        "Job {} ({}) on {} failed (attempt {}/{}), retrying in {:?}: {}",
                        job.id,
                        job.name,
                        queue,
                        retried.attempt,
                        job.max_attempts,
                        delay,
                        reason
                    );
                    if let Err(e) = self.schedule_delayed(queue, &retried, delay).await {
                        log::error!("Failed to schedule retry for job {}: {}", job.id, e);
                    }
                }
                FailurePlan::Exhausted => {
                    log::error!(
                        "Job {} ({}) on {} exhausted {} attempts: {}",
                        job.id,
                        job.name,
                        queue,
                        job.max_attempts,
                        reason
                    );
                    handler.on_exhausted(&job, &reason).await;
                    let mut dead = job.clone();
                    dead.attempt += 1;
                    if let Err(e) = self.push_dlq(queue, &dead).await {
                        log::error!("Failed to move job {} to DLQ: {}", job.id, e);
                    }
                }
            },
        }
    }
}
