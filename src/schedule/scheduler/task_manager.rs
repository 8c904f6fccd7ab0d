use std::sync::Arc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use chrono::Utc;
use tracing::{info, warn, error, debug};

use crate::schedule::error::TaskError;
use crate::schedule::limiter::ConcurrencyLimiter;
use crate::schedule::processors::TaskProcessor;
use crate::schedule::types::{
    CleanupStats, FailureKind, Task, TaskConfig, TaskFailure, TaskMutation, TaskPage, TaskProgress, TaskStats, TaskStatus,
    TranscribeResult,
};
use crate::storage::task::TaskStorage;
use crate::web::Pagination;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tasks allowed on the accelerator at once.
    pub max_concurrent_tasks: usize,
    /// Pending tasks beyond which submissions are refused.
    pub max_backlog: usize,
    /// How long a task may wait for a slot. `None` waits forever.
    pub queue_timeout: Option<Duration>,
    /// How long a task may run once started. `None` never times out.
    pub task_timeout: Option<Duration>,
    /// Terminal tasks older than this are removed by the reaper.
    pub cleanup_after: Duration,
    /// `None` disables the reaper.
    pub cleanup_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            max_backlog: 32,
            queue_timeout: Some(Duration::from_secs(1800)),
            task_timeout: Some(Duration::from_secs(3600)),
            cleanup_after: Duration::from_secs(24 * 3600),
            cleanup_interval: Some(Duration::from_secs(3600)),
        }
    }
}

pub struct TaskManager {
    storage: Arc<dyn TaskStorage>,
    processor: Arc<dyn TaskProcessor>,
    limiter: ConcurrencyLimiter,
    queue: mpsc::UnboundedSender<String>,
    // tasks still pending; bounded by `max_backlog`
    backlog: AtomicUsize,
    // one token per live task; fired by cancel and delete
    tokens: Mutex<HashMap<String, CancellationToken>>,
    config: SchedulerConfig,
}

impl TaskManager {
    /// Builds a manager plus the receiving end of its dispatch queue, which
    /// belongs to the [`TaskScheduler`](super::TaskScheduler).
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        processor: Arc<dyn TaskProcessor>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (queue, receiver) = mpsc::unbounded_channel();
        info!(
            "Task manager using {} with {} slot(s), backlog {}",
            processor.name(),
            config.max_concurrent_tasks,
            config.max_backlog
        );
        let manager = Self {
            storage,
            processor,
            limiter: ConcurrencyLimiter::new(config.max_concurrent_tasks),
            queue,
            backlog: AtomicUsize::new(0),
            tokens: Mutex::new(HashMap::new()),
            config,
        };
        (manager, receiver)
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    pub fn processor(&self) -> &Arc<dyn TaskProcessor> {
        &self.processor
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Records a new pending task and queues it for dispatch.
    ///
    /// The input artifact stays with the caller until this returns `Ok`.
    pub async fn create_task(&self, config: TaskConfig) -> Result<Task, TaskError> {
        self.processor.validate_params(&config)?;

        self.enter_backlog()?;

        let task = Task::new(Uuid::new_v4().to_string(), config);
        if let Err(e) = self.storage.create(&task).await {
            self.leave_backlog();
            return Err(e);
        }
        self.tokens.lock().await.insert(task.id.clone(), CancellationToken::new());

        if self.queue.send(task.id.clone()).is_err() {
            error!("Dispatch queue is closed, rejecting task {}", task.id);
            self.tokens.lock().await.remove(&task.id);
            if let Err(e) = self.storage.delete(&task.id).await {
                error!("Failed to roll back task {}: {}", task.id, e);
            }
            self.leave_backlog();
            return Err(TaskError::SchedulerUnavailable);
        }

        info!("Created task {} for {}", task.id, task.config.input_path.display());
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.storage.get(task_id).await
    }

    pub async fn get_progress(&self, task_id: &str) -> Result<TaskProgress, TaskError> {
        Ok(self.storage.get(task_id).await?.progress_view())
    }

    pub async fn get_result(&self, task_id: &str) -> Result<TranscribeResult, TaskError> {
        let task = self.storage.get(task_id).await?;
        match (task.status, task.result, task.error) {
            (TaskStatus::Completed, Some(result), _) => Ok(result),
            (TaskStatus::Completed, None, _) => Err(TaskError::Failed {
                task_id: task.id,
                failure: TaskFailure::new(FailureKind::Internal, "task completed but result is missing"),
            }),
            (TaskStatus::Failed, _, failure) => Err(TaskError::Failed {
                task_id: task.id,
                failure: failure.unwrap_or_else(|| TaskFailure::new(FailureKind::Internal, "unknown error")),
            }),
            (TaskStatus::Cancelled, _, _) => Err(TaskError::Cancelled(task.id)),
            (status @ (TaskStatus::Pending | TaskStatus::Processing), _, _) => Err(TaskError::NotReady {
                task_id: task.id,
                status,
                progress: task.progress,
            }),
        }
    }

    /// Cancels a pending or processing task.
    ///
    /// The store shows `cancelled` as soon as this returns. A running engine
    /// is asked to stop through the task's token and keeps its slot until it
    /// actually returns.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, TaskError> {
        // record first: the engine may return as soon as the token fires
        let task = self
            .storage
            .update(task_id, TaskMutation::Cancel { reason: "Task cancelled".to_string() })
            .await?;
        if let Some(token) = self.tokens.lock().await.get(task_id) {
            token.cancel();
        }
        info!("Cancelled task {}", task_id);

        // never started: no worker will clean up after it
        if task.started_at.is_none() {
            self.leave_backlog();
            self.finish(&task).await;
        }
        Ok(task)
    }

    /// Removes the task record and its audio, whatever state it is in.
    pub async fn delete_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let task = self.storage.delete(task_id).await?;
        if task.status == TaskStatus::Pending {
            self.leave_backlog();
        }
        if let Some(token) = self.tokens.lock().await.remove(task_id) {
            token.cancel();
        }
        self.processor.cleanup(&task).await;
        info!("Deleted task {} ({})", task_id, task.status);
        Ok(task)
    }

    /// Tasks accepted but not yet started or finished.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub async fn list_tasks(
        &self,
        pagination: &Pagination,
        status: Option<TaskStatus>,
    ) -> Result<TaskPage, TaskError> {
        let pagination = pagination.check();
        let tasks: Vec<Task> = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();

        Ok(TaskPage {
            index: pagination.index,
            size: pagination.size,
            total: tasks.len(),
            tasks: tasks
                .iter()
                .skip(pagination.offset() as usize)
                .take(pagination.limit() as usize)
                .map(Task::progress_view)
                .collect(),
        })
    }

    pub async fn get_stats(&self) -> Result<TaskStats, TaskError> {
        let mut stats = TaskStats::default();
        for task in self.storage.list().await? {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Deletes terminal tasks that finished more than `retention` ago.
    pub async fn cleanup_tasks(&self, retention: Duration) -> Result<CleanupStats, TaskError> {
        let mut stats = CleanupStats::default();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return Ok(stats);
        };

        for task in self.storage.list().await? {
            let expired = task.is_terminal() && task.completed_at.map_or(false, |at| at < cutoff);
            if !expired {
                continue;
            }
            match self.delete_task(&task.id).await {
                Ok(_) => match task.status {
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Failed => stats.failed += 1,
                    TaskStatus::Cancelled => stats.cancelled += 1,
                    _ => {}
                },
                // deleted concurrently
                Err(TaskError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if stats != CleanupStats::default() {
            info!("Cleaned up old tasks: {:?}", stats);
        }
        Ok(stats)
    }

    fn enter_backlog(&self) -> Result<(), TaskError> {
        let limit = self.config.max_backlog.max(1);
        self.backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| {
                warn!("Rejecting task: backlog of {} is full", limit);
                TaskError::CapacityExceeded { backlog: limit }
            })
    }

    /// Called exactly once per task, on the store change that moved it out of
    /// `pending`.
    pub(super) fn leave_backlog(&self) {
        let _ = self
            .backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(super) async fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().await.get(task_id).cloned()
    }

    /// When a task created at `task.created_at` stops waiting for a slot.
    pub(super) fn queue_deadline(&self, task: &Task) -> Option<Instant> {
        let timeout = self.config.queue_timeout?;
        let waited = (Utc::now() - task.created_at).to_std().unwrap_or_default();
        Some(Instant::now() + timeout.saturating_sub(waited))
    }

    /// Applies a mutation, treating a vanished task as a no-op.
    pub(super) async fn update(&self, task_id: &str, mutation: TaskMutation) -> Option<Task> {
        match self.storage.update(task_id, mutation).await {
            Ok(task) => Some(task),
            Err(TaskError::NotFound(_)) => {
                debug!("Task {} was deleted, dropping update", task_id);
                None
            }
            Err(e @ TaskError::InvalidTransition { from: TaskStatus::Cancelled, .. }) => {
                debug!("{}", e);
                None
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Terminal bookkeeping: forget the token and release the input unless
    /// the submitter asked to keep it.
    pub(super) async fn finish(&self, task: &Task) {
        self.tokens.lock().await.remove(&task.id);
        if !task.config.retain_input {
            self.processor.cleanup(task).await;
        }
    }
}
