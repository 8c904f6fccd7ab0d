use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, debug};

use crate::asr::{ProgressEvent, ProgressSink};
use crate::schedule::limiter::Permit;
use crate::schedule::types::{FailureKind, TaskFailure, TaskMutation, TranscribeResult};
use super::TaskManager;

enum Outcome {
    Completed(TranscribeResult),
    Failed(TaskFailure),
    Cancelled,
    TimedOut,
}

/// Drives one task from `processing` to a terminal state.
pub struct TaskWorker {
    task_manager: Arc<TaskManager>,
    task_id: String,
    cancel: CancellationToken,
}

impl TaskWorker {
    pub fn new(task_manager: Arc<TaskManager>, task_id: String, cancel: CancellationToken) -> Self {
        Self {
            task_manager,
            task_id,
            cancel,
        }
    }

    pub async fn run(self, permit: Permit) {
        let Some(task) = self.task_manager.update(&self.task_id, TaskMutation::Start).await else {
            // cancelled or deleted between admission and start
            debug!("Task {} not started, releasing slot", self.task_id);
            self.task_manager.limiter().release(permit);
            return;
        };
        self.task_manager.leave_backlog();
        info!("Processing task {}", task.id);

        let (sink, mut events) = ProgressSink::channel(self.cancel.clone());
        let processor = self.task_manager.processor().clone();
        let engine_task = task.clone();
        // the slot belongs to the engine run, not to the bookkeeping around it
        let mut engine = tokio::spawn(async move {
            let _permit = permit;
            processor.process(&engine_task, sink).await
        });

        let task_timeout = self.task_manager.config().task_timeout;
        let timeout = async {
            match task_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let outcome = loop {
            tokio::select! {
                biased;
                joined = &mut engine => break match joined {
                    Ok(Ok(result)) => Outcome::Completed(result),
                    // the engine gave up because it was asked to
                    Ok(Err(_)) if self.cancel.is_cancelled() => Outcome::Cancelled,
                    Ok(Err(failure)) => Outcome::Failed(failure),
                    Err(e) => {
                        warn!("Engine for task {} did not return: {}", self.task_id, e);
                        Outcome::Failed(TaskFailure::new(FailureKind::Internal, format!("engine panicked: {}", e)))
                    }
                },
                _ = self.cancel.cancelled() => break Outcome::Cancelled,
                Some(event) = events.recv() => self.report(event).await,
                _ = &mut timeout => break Outcome::TimedOut,
            }
        };

        // ticks sent before the engine returned still count
        if !matches!(outcome, Outcome::Cancelled) {
            while let Ok(event) = events.try_recv() {
                self.report(event).await;
            }
        }
        drop(events);

        let mutation = match outcome {
            Outcome::Completed(result) => TaskMutation::Complete(result),
            Outcome::Failed(failure) => TaskMutation::Fail(failure),
            Outcome::Cancelled => TaskMutation::Cancel { reason: "Task cancelled".to_string() },
            Outcome::TimedOut => {
                let limit = task_timeout.map(|d| d.as_secs()).unwrap_or_default();
                TaskMutation::Fail(TaskFailure::new(
                    FailureKind::Timeout,
                    format!("task exceeded the {}s processing limit", limit),
                ))
            }
        };

        if let Some(done) = self.task_manager.update(&self.task_id, mutation).await {
            info!("Task {} finished as {}", done.id, done.status);
        }

        if !engine.is_finished() {
            // stop the engine cooperatively; it keeps its slot until it returns
            self.cancel.cancel();
            debug!("Detached engine for task {}", self.task_id);
        }
        self.task_manager.finish(&task).await;
    }

    async fn report(&self, event: ProgressEvent) {
        let mutation = TaskMutation::Progress {
            percent: event.percent,
            message: event.message,
        };
        if self.task_manager.update(&self.task_id, mutation).await.is_none() {
            debug!("Discarded progress for task {}", self.task_id);
        }
    }
}
