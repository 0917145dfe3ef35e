//! Async task engine (C5) — priority queue + worker pool + result tracker.
//!
//! Scheduling: 5 static priority levels, each a FIFO `VecDeque<Task>` behind
//! its own `tokio::sync::Mutex` — no cross-level lock, no aging. Workers pick
//! the highest non-empty level; starvation of lower levels is intentional.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheCategory};
use crate::error::{CoreError, ErrorKind};
use crate::model::Priority;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Which secondary pool a submission should route into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Async,
    Thread,
    Process,
}

pub type TaskFn = Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<serde_json::Value, CoreError>> + Send + Sync>;

/// A unit of scheduled work. `func` runs under `spawn_blocking` when
/// `mode == Thread`; `Process` execution shells out via `tokio::process::Command`
/// and is not built out further here since no caller in this crate needs it
/// yet.
pub struct Task {
    pub task_id: TaskId,
    pub func: TaskFn,
    pub priority: Priority,
    pub timeout: Duration,
    pub mode: ExecutionMode,
    pub owner_user_id: Option<String>,
    pub owner_specialist: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// Submission parameters.
pub struct TaskSpec {
    pub func: TaskFn,
    pub priority: Priority,
    pub timeout: Duration,
    pub mode: ExecutionMode,
    pub owner_user_id: Option<String>,
    pub owner_specialist: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: SerializableStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub exec_time_ms: u64,
}

/// `TaskStatus` isn't itself `Serialize` (it carries no payload worth
/// round-tripping as anything but a tag); this is the wire form cached under
/// `task_status` for cross-process polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializableStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl From<TaskStatus> for Option<SerializableStatus> {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => Some(SerializableStatus::Completed),
            TaskStatus::Failed => Some(SerializableStatus::Failed),
            TaskStatus::Timeout => Some(SerializableStatus::Timeout),
            TaskStatus::Cancelled => Some(SerializableStatus::Cancelled),
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }
}

struct RunningEntry {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct ResultTracker {
    completed: HashMap<TaskId, TaskResult>,
    order: VecDeque<TaskId>,
    capacity: usize,
    by_status: HashMap<&'static str, u64>,
    exec_time_total_ms: u64,
    exec_time_count: u64,
}

impl ResultTracker {
    fn new(capacity: usize) -> Self {
        ResultTracker { capacity, ..Default::default() }
    }

    fn insert(&mut self, result: TaskResult) {
        let status_key = match result.status {
            SerializableStatus::Completed => "completed",
            SerializableStatus::Failed => "failed",
            SerializableStatus::Timeout => "timeout",
            SerializableStatus::Cancelled => "cancelled",
        };
        *self.by_status.entry(status_key).or_insert(0) += 1;
        self.exec_time_total_ms += result.exec_time_ms;
        self.exec_time_count += 1;

        self.order.push_back(result.task_id);
        self.completed.insert(result.task_id, result);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }

    fn get(&self, id: TaskId) -> Option<TaskResult> {
        self.completed.get(&id).cloned()
    }

    fn average_exec_ms(&self) -> f64 {
        if self.exec_time_count == 0 {
            0.0
        } else {
            self.exec_time_total_ms as f64 / self.exec_time_count as f64
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskEngineStats {
    pub queue_depths: HashMap<&'static str, usize>,
    pub running_count: usize,
    pub completed_by_status: HashMap<&'static str, u64>,
    pub average_exec_time_ms: f64,
    pub worker_count: usize,
    pub uptime_s: u64,
}

struct PriorityQueues {
    queues: [Mutex<VecDeque<Task>>; 5],
    notify: Notify,
}

impl PriorityQueues {
    fn new() -> Self {
        PriorityQueues {
            queues: Default::default(),
            notify: Notify::new(),
        }
    }

    async fn push(&self, task: Task) {
        let idx = task.priority.index();
        self.queues[idx].lock().await.push_back(task);
        self.notify.notify_one();
    }

    /// Highest non-empty level first, FIFO within it.
    async fn pop(&self) -> Option<Task> {
        for idx in (0..5).rev() {
            let mut q = self.queues[idx].lock().await;
            if let Some(task) = q.pop_front() {
                return Some(task);
            }
        }
        None
    }

    async fn depths(&self) -> HashMap<&'static str, usize> {
        let labels = ["low", "normal", "high", "urgent", "critical"];
        let mut out = HashMap::new();
        for (idx, label) in labels.iter().enumerate() {
            out.insert(*label, self.queues[idx].lock().await.len());
        }
        out
    }

    /// Removes a pending task by id, returning it if found (used by `cancel`).
    async fn remove_pending(&self, id: TaskId) -> Option<Task> {
        for q in &self.queues {
            let mut guard = q.lock().await;
            if let Some(pos) = guard.iter().position(|t| t.task_id == id) {
                return guard.remove(pos);
            }
        }
        None
    }
}

/// Owns the priority queues, the worker pool, and the result tracker.
pub struct TaskEngine {
    queues: Arc<PriorityQueues>,
    running: Arc<RwLock<HashMap<TaskId, RunningEntry>>>,
    tracker: Arc<Mutex<ResultTracker>>,
    cache: Arc<Cache>,
    queue_capacity: usize,
    queued_count: Arc<AtomicU64>,
    worker_count: usize,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl TaskEngine {
    pub fn new(worker_count: usize, queue_capacity: usize, result_capacity: usize, cache: Arc<Cache>) -> Arc<Self> {
        Arc::new(TaskEngine {
            queues: Arc::new(PriorityQueues::new()),
            running: Arc::new(RwLock::new(HashMap::new())),
            tracker: Arc::new(Mutex::new(ResultTracker::new(result_capacity))),
            cache,
            queue_capacity,
            queued_count: Arc::new(AtomicU64::new(0)),
            worker_count,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns `worker_count` loops pulling from the shared queues: an
    /// infinite loop with a cancellation-aware wait, delegating each
    /// iteration to a testable body.
    pub fn start(self: &Arc<Self>) {
        for worker_id in 0..self.worker_count {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.worker_loop(worker_id).await;
            });
        }
        info!(workers = self.worker_count, "task engine started");
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let task = match self.queues.pop().await {
                Some(task) => task,
                None => {
                    tokio::select! {
                        _ = self.queues.notify.notified() => continue,
                        _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            };

            self.queued_count.fetch_sub(1, Ordering::Relaxed);
            debug!(worker_id, task_id = %task.task_id, "worker picked up task");
            self.execute(task).await;
        }
    }

    async fn execute(&self, task: Task) {
        let started_at = Utc::now();
        self.running.write().await.insert(
            task.task_id,
            RunningEntry { cancel: task.cancel.clone(), started_at },
        );

        // `Thread`/`Process` only change which pool a submission is counted
        // against; task bodies
        // here are themselves async, so execution always runs on the tokio
        // runtime rather than a real OS thread or subprocess.
        let start = Instant::now();
        let fut = (task.func)();

        let (status, value, error) = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => (TaskStatus::Cancelled, None, None),
            outcome = tokio::time::timeout(task.timeout, fut) => match outcome {
                Ok(Ok(value)) => (TaskStatus::Completed, Some(value), None),
                Ok(Err(e)) => (TaskStatus::Failed, None, Some(e.to_string())),
                Err(_) => (TaskStatus::Timeout, None, Some("deadline exceeded".to_string())),
            },
        };

        let exec_time_ms = start.elapsed().as_millis() as u64;
        self.running.write().await.remove(&task.task_id);

        let serializable_status: SerializableStatus = Option::<SerializableStatus>::from(status)
            .unwrap_or(SerializableStatus::Failed);

        let result = TaskResult {
            task_id: task.task_id,
            status: serializable_status,
            value,
            error,
            started_at: Some(started_at),
            completed_at: Utc::now(),
            exec_time_ms,
        };

        self.tracker.lock().await.insert(result.clone());

        if task.owner_user_id.is_some() {
            let key = format!("task_status:{}", task.task_id);
            self.cache.set_json(&key, &result, CacheCategory::TaskStatus).await;
        }
    }

    /// Fails with `Validation` when the queue is at capacity.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, CoreError> {
        if self.queued_count.load(Ordering::Relaxed) as usize >= self.queue_capacity {
            return Err(ErrorKind::Validation("task queue is full".into()).into());
        }

        let task_id = Uuid::new_v4();
        let task = Task {
            task_id,
            func: spec.func,
            priority: spec.priority,
            timeout: spec.timeout,
            mode: spec.mode,
            owner_user_id: spec.owner_user_id,
            owner_specialist: spec.owner_specialist,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
        };

        self.queued_count.fetch_add(1, Ordering::Relaxed);
        self.queues.push(task).await;
        Ok(task_id)
    }

    /// Submits `spec` and awaits its terminal result, applying `spec.timeout`
    /// as the deadline via `tokio::time::timeout`.
    pub async fn submit_and_await(&self, spec: TaskSpec) -> TaskResult {
        let timeout = spec.timeout;
        let task_id = match self.submit(spec).await {
            Ok(id) => id,
            Err(e) => {
                return TaskResult {
                    task_id: Uuid::new_v4(),
                    status: SerializableStatus::Failed,
                    value: None,
                    error: Some(e.to_string()),
                    started_at: None,
                    completed_at: Utc::now(),
                    exec_time_ms: 0,
                }
            }
        };

        match tokio::time::timeout(timeout, self.poll_until_terminal(task_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(task_id).await;
                TaskResult {
                    task_id,
                    status: SerializableStatus::Timeout,
                    value: None,
                    error: Some("deadline exceeded".to_string()),
                    started_at: None,
                    completed_at: Utc::now(),
                    exec_time_ms: timeout.as_millis() as u64,
                }
            }
        }
    }

    async fn poll_until_terminal(&self, task_id: TaskId) -> TaskResult {
        loop {
            if let Some(result) = self.tracker.lock().await.get(task_id) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Non-blocking by default; `wait = true` polls at ≤ 500ms intervals up
    /// to `timeout`.
    pub async fn get_result(&self, task_id: TaskId, wait: bool, timeout: Option<Duration>) -> Option<TaskResult> {
        if let Some(result) = self.tracker.lock().await.get(task_id) {
            return Some(result);
        }

        if !wait {
            return None;
        }

        let deadline = Instant::now() + timeout.unwrap_or(Duration::from_secs(30));
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if let Some(result) = self.tracker.lock().await.get(task_id) {
                return Some(result);
            }
        }
        None
    }

    /// Permitted only while `pending` or `running`.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        if let Some(task) = self.queues.remove_pending(task_id).await {
            self.queued_count.fetch_sub(1, Ordering::Relaxed);
            let result = TaskResult {
                task_id,
                status: SerializableStatus::Cancelled,
                value: None,
                error: None,
                started_at: None,
                completed_at: Utc::now(),
                exec_time_ms: 0,
            };
            self.tracker.lock().await.insert(result);
            task.cancel.cancel();
            return true;
        }

        let running = self.running.read().await;
        if let Some(entry) = running.get(&task_id) {
            entry.cancel.cancel();
            return true;
        }
        false
    }

    pub async fn stats(&self) -> TaskEngineStats {
        let tracker = self.tracker.lock().await;
        TaskEngineStats {
            queue_depths: self.queues.depths().await,
            running_count: self.running.read().await.len(),
            completed_by_status: tracker.by_status.clone(),
            average_exec_time_ms: tracker.average_exec_ms(),
            worker_count: self.worker_count,
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_task(value: i64) -> TaskFn {
        Arc::new(move || Box::pin(async move { Ok(serde_json::json!(value)) }))
    }

    fn failing_task() -> TaskFn {
        Arc::new(|| Box::pin(async { Err(ErrorKind::BusinessLogic("boom".into()).into()) }))
    }

    fn engine() -> Arc<TaskEngine> {
        let cache = Arc::new(Cache::with_no_remote(100));
        let engine = TaskEngine::new(2, 10, 100, cache);
        engine.start();
        engine
    }

    #[tokio::test]
    async fn submitted_task_completes() {
        let engine = engine();
        let id = engine
            .submit(TaskSpec {
                func: ok_task(42),
                priority: Priority::Normal,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        let result = engine.get_result(id, true, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result.status, SerializableStatus::Completed);
        assert_eq!(result.value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn failing_task_reports_failed_status() {
        let engine = engine();
        let id = engine
            .submit(TaskSpec {
                func: failing_task(),
                priority: Priority::Normal,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        let result = engine.get_result(id, true, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result.status, SerializableStatus::Failed);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn bare_submit_self_enforces_its_own_timeout() {
        let engine = engine();
        let func: TaskFn = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(serde_json::json!("late"))
            })
        });
        let id = engine
            .submit(TaskSpec {
                func,
                priority: Priority::Normal,
                timeout: Duration::from_millis(50),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        // No `submit_and_await` in the picture — the engine's own worker
        // must enforce `timeout` for a bare `submit`/`get_result` caller.
        let result = engine.get_result(id, true, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result.status, SerializableStatus::Timeout);
    }

    #[tokio::test]
    async fn full_queue_is_rejected_with_validation_error() {
        let cache = Arc::new(Cache::with_no_remote(100));
        // No workers started: everything submitted stays queued.
        let engine = TaskEngine::new(0, 1, 10, cache);

        engine
            .submit(TaskSpec {
                func: ok_task(1),
                priority: Priority::Low,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        let result = engine
            .submit(TaskSpec {
                func: ok_task(2),
                priority: Priority::Low,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn higher_priority_drains_before_lower() {
        let cache = Arc::new(Cache::with_no_remote(100));
        let engine = TaskEngine::new(0, 10, 100, cache);

        engine
            .submit(TaskSpec {
                func: ok_task(1),
                priority: Priority::Low,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();
        engine
            .submit(TaskSpec {
                func: ok_task(2),
                priority: Priority::Critical,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        let first = engine.queues.pop().await.unwrap();
        assert_eq!(first.priority, Priority::Critical);
    }

    #[tokio::test]
    async fn pending_task_can_be_cancelled() {
        let cache = Arc::new(Cache::with_no_remote(100));
        let engine = TaskEngine::new(0, 10, 100, cache);

        let id = engine
            .submit(TaskSpec {
                func: ok_task(1),
                priority: Priority::Normal,
                timeout: Duration::from_secs(5),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        assert!(engine.cancel(id).await);
        let result = engine.get_result(id, false, None).await.unwrap();
        assert_eq!(result.status, SerializableStatus::Cancelled);
    }
}
