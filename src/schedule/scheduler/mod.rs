mod task_manager;
mod worker;

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use tracing::{info, warn, error, debug};

pub use task_manager::{SchedulerConfig, TaskManager};
use worker::TaskWorker;
use crate::schedule::limiter::AcquireError;
use crate::schedule::types::{FailureKind, TaskFailure, TaskMutation, TaskStatus};

/// Admits queued tasks onto the limiter in submission order and runs the
/// retention reaper.
pub struct TaskScheduler {
    task_manager: Arc<TaskManager>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(task_manager: Arc<TaskManager>, queue: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            task_manager,
            queue: Mutex::new(Some(queue)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Stops dispatching. Tasks already running finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("Task scheduler is already running"))?;

        // start retention cleanup
        if let Some(interval) = self.task_manager.config().cleanup_interval {
            let tm = self.task_manager.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = tm.cleanup_tasks(tm.config().cleanup_after).await {
                        error!("Error cleaning up old tasks: {}", e);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            });
        }

        info!("Task scheduler started");
        loop {
            let task_id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(task_id) => task_id,
                    None => break,
                },
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.dispatch(task_id) => {}
            }
        }
        info!("Task scheduler stopped");
        Ok(())
    }

    async fn dispatch(&self, task_id: String) {
        let tm = &self.task_manager;
        let task = match tm.get_task(&task_id).await {
            Ok(task) => task,
            Err(e) => {
                debug!("Skipping queued task: {}", e);
                return;
            }
        };
        if task.status != TaskStatus::Pending {
            debug!("Skipping task {}: already {}", task.id, task.status);
            return;
        }
        let Some(cancel) = tm.cancellation_token(&task.id).await else {
            debug!("Skipping task {}: no longer tracked", task.id);
            return;
        };

        match tm.limiter().acquire(&cancel, tm.queue_deadline(&task)).await {
            Ok(permit) => {
                let worker = TaskWorker::new(tm.clone(), task.id, cancel);
                tokio::spawn(worker.run(permit));
            }
            Err(AcquireError::Cancelled) => {
                info!("Task {} cancelled while waiting for a slot", task.id);
            }
            Err(AcquireError::TimedOut) => {
                warn!("Task {} waited too long for a processing slot", task.id);
                let failure = TaskFailure::new(
                    FailureKind::CapacityExceeded,
                    "no processing slot became available in time",
                );
                if let Some(task) = tm.update(&task.id, TaskMutation::Fail(failure)).await {
                    tm.leave_backlog();
                    tm.finish(&task).await;
                }
            }
            Err(AcquireError::Closed) => {
                error!("Concurrency limiter closed, failing task {}", task.id);
                let failure = TaskFailure::new(FailureKind::CapacityExceeded, "concurrency limiter is closed");
                if let Some(task) = tm.update(&task.id, TaskMutation::Fail(failure)).await {
                    tm.leave_backlog();
                    tm.finish(&task).await;
                }
            }
        }
    }
}
