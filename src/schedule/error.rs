use crate::schedule::types::{TaskFailure, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {task_id} cannot {action} while {from}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        action: &'static str,
    },

    #[error("task backlog is full ({backlog} waiting), retry later")]
    CapacityExceeded { backlog: usize },

    #[error("task {task_id} is still {status} ({progress:.1}%)")]
    NotReady {
        task_id: String,
        status: TaskStatus,
        progress: f32,
    },

    #[error("task {task_id} failed: {failure}")]
    Failed { task_id: String, failure: TaskFailure },

    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error("invalid task params: {0}")]
    InvalidParams(String),

    #[error("task scheduler is not running")]
    SchedulerUnavailable,
}

impl TaskError {
    pub fn invalid_transition(task_id: &str, from: &TaskStatus, action: &'static str) -> Self {
        TaskError::InvalidTransition {
            task_id: task_id.to_string(),
            from: from.clone(),
            action,
        }
    }
}
