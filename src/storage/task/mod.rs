use async_trait::async_trait;

use crate::schedule::error::TaskError;
use crate::schedule::types::{Task, TaskMutation};

pub mod memory;

pub use memory::InMemoryTaskStorage;

/// Task record store.
///
/// `update` must be atomic with respect to every other call on the same
/// store: the mutation is validated by [`Task::apply`] and either fully
/// written or not written at all.
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    async fn create(&self, task: &Task) -> Result<(), TaskError>;
    async fn get(&self, task_id: &str) -> Result<Task, TaskError>;
    async fn update(&self, task_id: &str, mutation: TaskMutation) -> Result<Task, TaskError>;
    async fn delete(&self, task_id: &str) -> Result<Task, TaskError>;
    /// Snapshot of all tasks, oldest first.
    async fn list(&self) -> Result<Vec<Task>, TaskError>;
}
