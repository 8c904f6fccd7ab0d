pub mod transcribe;

use async_trait::async_trait;

use crate::asr::ProgressSink;
use crate::schedule::error::TaskError;
use crate::schedule::types::{Task, TaskConfig, TaskFailure, TranscribeResult};

pub use transcribe::TranscribeProcessor;

/// Runs one task's engine work. Implementations turn every engine failure
/// into a [`TaskFailure`]; nothing they return should take the worker down.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate_params(&self, config: &TaskConfig) -> Result<(), TaskError>;
    async fn process(&self, task: &Task, progress: ProgressSink) -> Result<TranscribeResult, TaskFailure>;
    async fn cleanup(&self, task: &Task);
}
