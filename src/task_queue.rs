// SPDX-License-Identifier: MIT
//! Bounded-concurrency background task queue.
//!
//! A single dispatcher loop pulls task ids off an mpsc channel and spawns one
//! execution per task, gated by a counting semaphore sized at construction.
//! Each execution retries the job with exponential backoff (`base * 2^n`,
//! capped) and marks the task `failed` after exhausting retries. A cleanup
//! loop purges terminal tasks older than the configured TTL.
//!
//! Cancellation is only honored while a task is still pending; there are no
//! cross-task ordering guarantees.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::telemetry::SharedCounters;

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
/// A job must be re-callable: every retry attempt invokes it again.
type Job = Box<dyn Fn() -> JobFuture + Send + Sync>;

// ── Task model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Externally visible task metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    /// Attempts started so far (1-based once running).
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last error, retained after retry exhaustion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TaskEntry {
    info: TaskInfo,
    result: Option<Value>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} is not cancellable (state: {state})")]
    NotCancellable { id: String, state: TaskState },
    #[error("task {id} failed after {attempts} attempts: {reason}")]
    TaskFailed {
        id: String,
        attempts: u32,
        reason: String,
    },
}

// ── Retry policy ─────────────────────────────────────────────────────────────

/// Exponential backoff: delay before retry `n` (0-indexed) is
/// `base * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Config suitable for unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(ms).min(self.max_delay)
    }
}

// ── TaskQueue ────────────────────────────────────────────────────────────────

pub struct TaskQueue {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    /// Jobs awaiting dispatch. Removed on dispatch or cancel — a missing job
    /// at execution time means the task was cancelled while pending.
    jobs: Mutex<HashMap<String, Job>>,
    tx: mpsc::UnboundedSender<String>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    counters: SharedCounters,
}

impl TaskQueue {
    /// Build the queue and start its dispatcher + cleanup loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &QueueConfig, counters: SharedCounters) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            tx,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: RetryPolicy::from_config(config),
            counters,
        });

        tokio::spawn(Arc::clone(&queue).run_dispatcher(rx));
        tokio::spawn(Arc::clone(&queue).run_cleanup(
            Duration::from_secs(config.task_ttl_secs),
            Duration::from_secs(config.cleanup_interval_secs.max(1)),
        ));
        queue
    }

    /// Enqueue a named job and return its task id.
    pub async fn enqueue<F, Fut>(&self, name: &str, job: F) -> String
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let entry = TaskEntry {
            info: TaskInfo {
                id: id.clone(),
                name: name.to_string(),
                state: TaskState::Pending,
                attempts: 0,
                enqueued_at: Utc::now(),
                finished_at: None,
                error: None,
            },
            result: None,
        };
        self.tasks.write().await.insert(id.clone(), entry);
        self.jobs
            .lock()
            .await
            .insert(id.clone(), Box::new(move || Box::pin(job()) as JobFuture));
        self.counters.inc_tasks_enqueued();

        if self.tx.send(id.clone()).is_err() {
            warn!(task_id = %id, "dispatcher is gone — task will never run");
        }
        debug!(task_id = %id, name, "task enqueued");
        id
    }

    pub async fn get_status(&self, id: &str) -> Option<TaskState> {
        self.tasks.read().await.get(id).map(|e| e.info.state)
    }

    pub async fn get_task(&self, id: &str) -> Option<TaskInfo> {
        self.tasks.read().await.get(id).map(|e| e.info.clone())
    }

    /// All known tasks, oldest first.
    pub async fn list_tasks(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<TaskInfo> = tasks.values().map(|e| e.info.clone()).collect();
        list.sort_by_key(|t| t.enqueued_at);
        list
    }

    /// Result of a completed task.
    ///
    /// `Ok(None)` while the task has not finished; a failed task surfaces the
    /// retained error as [`QueueError::TaskFailed`].
    pub async fn get_result(&self, id: &str) -> Result<Option<Value>, QueueError> {
        let tasks = self.tasks.read().await;
        let entry = tasks
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        match entry.info.state {
            TaskState::Completed => Ok(entry.result.clone()),
            TaskState::Failed => Err(QueueError::TaskFailed {
                id: id.to_string(),
                attempts: entry.info.attempts,
                reason: entry.info.error.clone().unwrap_or_default(),
            }),
            _ => Ok(None),
        }
    }

    /// Cancel a task. Only honored while the task is still pending.
    pub async fn cancel(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if entry.info.state != TaskState::Pending {
                return Err(QueueError::NotCancellable {
                    id: id.to_string(),
                    state: entry.info.state,
                });
            }
            entry.info.state = TaskState::Cancelled;
            entry.info.finished_at = Some(Utc::now());
        }
        self.jobs.lock().await.remove(id);
        self.counters.inc_tasks_cancelled();
        info!(task_id = %id, "task cancelled");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Remove terminal tasks that finished more than `ttl` ago. Returns the
    /// number purged. The cleanup loop calls this on an interval.
    pub async fn purge_terminal(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, e| {
            !(e.info.state.is_terminal() && e.info.finished_at.is_some_and(|t| t <= cutoff))
        });
        before - tasks.len()
    }

    // ── Background loops ─────────────────────────────────────────────────────

    async fn run_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(id) = rx.recv().await {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.execute(&id).await;
                drop(permit);
            });
        }
    }

    async fn run_cleanup(self: Arc<Self>, ttl: Duration, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            let purged = self.purge_terminal(ttl).await;
            if purged > 0 {
                debug!(purged, "purged terminal tasks");
            }
        }
    }

    async fn execute(&self, id: &str) {
        // A missing job means the task was cancelled while pending.
        let job = { self.jobs.lock().await.remove(id) };
        let Some(job) = job else {
            return;
        };

        {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(id) {
                // Cancel may have landed between job removal and here.
                Some(entry) if entry.info.state == TaskState::Pending => {
                    entry.info.state = TaskState::Running;
                }
                _ => return,
            }
        }

        let max_attempts = self.retry.max_retries + 1;
        let mut last_err = String::new();

        for attempt in 0..max_attempts {
            {
                let mut tasks = self.tasks.write().await;
                if let Some(entry) = tasks.get_mut(id) {
                    entry.info.attempts = attempt + 1;
                }
            }
            match job().await {
                Ok(value) => {
                    let mut tasks = self.tasks.write().await;
                    if let Some(entry) = tasks.get_mut(id) {
                        entry.info.state = TaskState::Completed;
                        entry.info.finished_at = Some(Utc::now());
                        entry.result = Some(value);
                    }
                    self.counters.inc_tasks_completed();
                    debug!(task_id = %id, attempt = attempt + 1, "task completed");
                    return;
                }
                Err(e) => {
                    last_err = format!("{e:#}");
                    if attempt + 1 < max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            task_id = %id,
                            attempt = attempt + 1,
                            max = max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            err = %last_err,
                            "task attempt failed — retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.get_mut(id) {
                entry.info.state = TaskState::Failed;
                entry.info.finished_at = Some(Utc::now());
                entry.info.error = Some(last_err.clone());
            }
        }
        self.counters.inc_tasks_failed();
        warn!(task_id = %id, attempts = max_attempts, err = %last_err, "task failed — retries exhausted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::OpsCounters;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(concurrency: usize, max_retries: u32) -> QueueConfig {
        QueueConfig {
            concurrency,
            max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            task_ttl_secs: 3600,
            cleanup_interval_secs: 3600,
        }
    }

    async fn wait_for_state(queue: &TaskQueue, id: &str, state: TaskState) {
        for _ in 0..400 {
            if queue.get_status(id).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "task {id} never reached {state} (now: {:?})",
            queue.get_status(id).await
        );
    }

    #[tokio::test]
    async fn enqueue_and_complete() {
        let queue = TaskQueue::new(&test_config(2, 0), OpsCounters::shared());
        let id = queue.enqueue("answer", || async { Ok(json!(42)) }).await;

        wait_for_state(&queue, &id, TaskState::Completed).await;
        assert_eq!(queue.get_result(&id).await.unwrap(), Some(json!(42)));

        let info = queue.get_task(&id).await.unwrap();
        assert_eq!(info.name, "answer");
        assert_eq!(info.attempts, 1);
        assert!(info.finished_at.is_some());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let queue = TaskQueue::new(&test_config(1, 0), OpsCounters::shared());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let id = queue
                .enqueue("probe", move || {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                })
                .await;
            ids.push(id);
        }
        for id in &ids {
            wait_for_state(&queue, id, TaskState::Completed).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "semaphore of 1 must serialize");
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let queue = TaskQueue::new(&test_config(2, 3), OpsCounters::shared());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let id = queue
            .enqueue("flaky", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        anyhow::bail!("attempt {n} failed");
                    }
                    Ok(json!(n))
                }
            })
            .await;

        wait_for_state(&queue, &id, TaskState::Completed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.get_task(&id).await.unwrap().attempts, 3);
        assert_eq!(queue.get_result(&id).await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn fails_after_retry_exhaustion() {
        let counters = OpsCounters::shared();
        let queue = TaskQueue::new(&test_config(2, 2), Arc::clone(&counters));
        let id = queue
            .enqueue("doomed", || async { anyhow::bail!("permanent error") })
            .await;

        wait_for_state(&queue, &id, TaskState::Failed).await;
        let info = queue.get_task(&id).await.unwrap();
        assert_eq!(info.attempts, 3); // first try + 2 retries
        assert_eq!(info.error.as_deref(), Some("permanent error"));

        match queue.get_result(&id).await {
            Err(QueueError::TaskFailed {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "permanent error");
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
        assert_eq!(counters.tasks_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancel_is_only_honored_while_pending() {
        let queue = TaskQueue::new(&test_config(1, 0), OpsCounters::shared());
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = Arc::clone(&gate);

        // Occupies the single execution slot until released.
        let blocker = queue
            .enqueue("blocker", move || {
                let gate = Arc::clone(&gate2);
                async move {
                    gate.notified().await;
                    Ok(json!(null))
                }
            })
            .await;
        wait_for_state(&queue, &blocker, TaskState::Running).await;

        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        let victim = queue
            .enqueue("victim", move || {
                let ran = Arc::clone(&ran2);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .await;

        // Pending result is Ok(None), not an error.
        assert_eq!(queue.get_result(&victim).await.unwrap(), None);

        queue.cancel(&victim).await.unwrap();
        assert_eq!(queue.get_status(&victim).await, Some(TaskState::Cancelled));

        // Running tasks refuse cancellation.
        match queue.cancel(&blocker).await {
            Err(QueueError::NotCancellable { state, .. }) => {
                assert_eq!(state, TaskState::Running);
            }
            other => panic!("expected NotCancellable, got {other:?}"),
        }

        gate.notify_one();
        wait_for_state(&queue, &blocker, TaskState::Completed).await;
        // Give the dispatcher a chance to (incorrectly) run the victim.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "cancelled job must never run");

        // Unknown ids are NotFound.
        assert!(matches!(
            queue.cancel("nope").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_tasks_only() {
        let queue = TaskQueue::new(&test_config(1, 0), OpsCounters::shared());
        let done = queue.enqueue("done", || async { Ok(json!(1)) }).await;
        wait_for_state(&queue, &done, TaskState::Completed).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = Arc::clone(&gate);
        let live = queue
            .enqueue("live", move || {
                let gate = Arc::clone(&gate2);
                async move {
                    gate.notified().await;
                    Ok(json!(null))
                }
            })
            .await;
        wait_for_state(&queue, &live, TaskState::Running).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let purged = queue.purge_terminal(Duration::ZERO).await;
        assert_eq!(purged, 1);
        assert!(queue.get_status(&done).await.is_none());
        assert_eq!(queue.get_status(&live).await, Some(TaskState::Running));

        gate.notify_one();
        wait_for_state(&queue, &live, TaskState::Completed).await;
    }

    #[tokio::test]
    async fn list_tasks_is_oldest_first() {
        let queue = TaskQueue::new(&test_config(4, 0), OpsCounters::shared());
        let a = queue.enqueue("a", || async { Ok(json!(null)) }).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = queue.enqueue("b", || async { Ok(json!(null)) }).await;

        let list = queue.list_tasks().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a);
        assert_eq!(list[1].id, b);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        // Large attempt numbers must not overflow.
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }
}
