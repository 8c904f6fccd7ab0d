use std::sync::Arc;

pub mod error;
pub mod limiter;
pub mod types;
pub mod processors;
pub mod scheduler;
#[cfg(test)]
mod tests;

pub use error::TaskError;
pub use types::{
    Task, TaskConfig, TaskStatus, TaskProgress, TaskFailure, FailureKind,
    TranscribeOptions, TranscribeResult,
};

pub use crate::storage::task::TaskStorage;

pub use processors::TaskProcessor;
pub use processors::transcribe::TranscribeProcessor;

pub use scheduler::{SchedulerConfig, TaskManager, TaskScheduler};

/// Wires a manager and its dispatcher together. Spawn
/// [`TaskScheduler::run`] to start processing.
pub fn create_scheduler(
    storage: Arc<dyn TaskStorage>,
    processor: Arc<dyn TaskProcessor>,
    config: SchedulerConfig,
) -> (Arc<TaskManager>, Arc<TaskScheduler>) {
    let (task_manager, queue) = TaskManager::new(storage, processor, config);
    let task_manager = Arc::new(task_manager);
    let scheduler = TaskScheduler::new(task_manager.clone(), queue);
    (task_manager, Arc::new(scheduler))
}
