use std::collections::HashMap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::schedule::error::TaskError;
use crate::schedule::types::{Task, TaskMutation};
use super::TaskStorage;

#[derive(Default)]
pub struct InMemoryTaskStorage {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn create(&self, task: &Task) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            error!("Refusing to overwrite stored task {}", task.id);
            return Err(TaskError::AlreadyExists(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        debug!("Stored task {}", task.id);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn update(&self, task_id: &str, mutation: TaskMutation) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        // apply to a copy so a rejected mutation leaves nothing behind
        let mut next = current.clone();
        next.apply(mutation)?;
        *current = next.clone();
        Ok(next)
    }

    async fn delete(&self, task_id: &str) -> Result<Task, TaskError> {
        self.tasks
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Task>, TaskError> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }
}
