use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt::Display;

use crate::asr::EngineErrorKind;
use crate::schedule::error::TaskError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
    #[serde(default = "default_diarization")]
    pub enable_diarization: bool,
}

fn default_diarization() -> bool {
    true
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            min_speakers: None,
            max_speakers: None,
            enable_diarization: default_diarization(),
        }
    }
}

/// Input owned by a task: the stored audio artifact and how to process it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub input_path: PathBuf,
    pub options: TranscribeOptions,
    /// Keep the audio file after the task finishes; it is still removed on delete.
    #[serde(default)]
    pub retain_input: bool,
}

impl TaskConfig {
    pub fn new(input_path: impl Into<PathBuf>, options: TranscribeOptions) -> Self {
        Self {
            input_path: input_path.into(),
            options,
            retain_input: false,
        }
    }

    pub fn with_retain_input(mut self, retain_input: bool) -> Self {
        self.retain_input = retain_input;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;
    fn try_from(status: &str) -> Result<Self, Self::Error> {
        match status.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidAudio,
    UnsupportedFormat,
    OutOfMemory,
    Model,
    Timeout,
    CapacityExceeded,
    Internal,
}

impl From<EngineErrorKind> for FailureKind {
    fn from(kind: EngineErrorKind) -> Self {
        match kind {
            EngineErrorKind::InvalidAudio => FailureKind::InvalidAudio,
            EngineErrorKind::UnsupportedFormat => FailureKind::UnsupportedFormat,
            EngineErrorKind::OutOfMemory => FailureKind::OutOfMemory,
            EngineErrorKind::Model => FailureKind::Model,
            // an engine that stops without being asked to is broken
            EngineErrorKind::Cancelled | EngineErrorKind::Internal => FailureKind::Internal,
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::InvalidAudio => "invalid_audio",
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::OutOfMemory => "out_of_memory",
            FailureKind::Model => "model",
            FailureKind::Timeout => "timeout",
            FailureKind::CapacityExceeded => "capacity_exceeded",
            FailureKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordSegment {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub score: Option<f64>,
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub speaker: Option<String>,
    pub words: Vec<WordSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub language: String,
    pub segments: Vec<TranscribeSegment>,
}

/// A state change requested against a task. See [`Task::apply`].
#[derive(Debug, Clone)]
pub enum TaskMutation {
    Start,
    Progress { percent: f32, message: String },
    Complete(TranscribeResult),
    Fail(TaskFailure),
    Cancel { reason: String },
}

impl TaskMutation {
    fn action(&self) -> &'static str {
        match self {
            TaskMutation::Start => "start",
            TaskMutation::Progress { .. } => "report progress",
            TaskMutation::Complete(_) => "complete",
            TaskMutation::Fail(_) => "fail",
            TaskMutation::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub message: String,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TranscribeResult>,
    pub error: Option<TaskFailure>,
}

impl Task {
    pub fn new(id: String, config: TaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            progress: 0.0,
            message: "Task queued".to_string(),
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies `mutation` if the state machine allows it.
    ///
    /// Legal paths are `pending -> processing -> {completed, failed, cancelled}`
    /// and `pending -> cancelled`; a pending task may also fail with
    /// [`FailureKind::CapacityExceeded`] when it never got a slot. Progress
    /// only moves forward while processing. A rejected mutation leaves the
    /// task untouched.
    pub fn apply(&mut self, mutation: TaskMutation) -> Result<(), TaskError> {
        let now = Utc::now();
        match (mutation, self.status) {
            (TaskMutation::Start, TaskStatus::Pending) => {
                self.status = TaskStatus::Processing;
                self.progress = 0.0;
                self.message = "Starting transcription".to_string();
                self.started_at = Some(now);
            }
            (TaskMutation::Progress { percent, message }, TaskStatus::Processing) => {
                if percent.is_finite() {
                    self.progress = percent.clamp(0.0, 100.0).max(self.progress);
                }
                self.message = message;
            }
            (TaskMutation::Complete(result), TaskStatus::Processing) => {
                self.status = TaskStatus::Completed;
                self.progress = 100.0;
                self.message = "Transcription completed successfully".to_string();
                self.result = Some(result);
                self.completed_at = Some(now);
            }
            (TaskMutation::Fail(failure), TaskStatus::Processing) => {
                self.fail(failure, now);
            }
            (TaskMutation::Fail(failure), TaskStatus::Pending)
                if failure.kind == FailureKind::CapacityExceeded =>
            {
                self.fail(failure, now);
            }
            (TaskMutation::Cancel { reason }, TaskStatus::Pending | TaskStatus::Processing) => {
                self.status = TaskStatus::Cancelled;
                self.message = reason;
                self.completed_at = Some(now);
            }
            (mutation, status) => {
                return Err(TaskError::invalid_transition(&self.id, &status, mutation.action()));
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn fail(&mut self, failure: TaskFailure, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.message = "Transcription failed".to_string();
        self.error = Some(failure);
        self.completed_at = Some(now);
    }

    pub fn progress_view(&self) -> TaskProgress {
        TaskProgress {
            task_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Status snapshot returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub index: u64,
    pub size: u64,
    pub total: usize,
    pub tasks: Vec<TaskProgress>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
