use std::fmt::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    InvalidAudio,
    UnsupportedFormat,
    OutOfMemory,
    Model,
    Cancelled,
    Internal,
}

impl Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineErrorKind::InvalidAudio => "invalid_audio",
            EngineErrorKind::UnsupportedFormat => "unsupported_format",
            EngineErrorKind::OutOfMemory => "out_of_memory",
            EngineErrorKind::Model => "model",
            EngineErrorKind::Cancelled => "cancelled",
            EngineErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

const OUT_OF_MEMORY_HINTS: &[&str] = &[
    "out of memory",
    "outofmemoryerror",
    "failed to allocate",
    "cudaerrormemoryallocation",
];
const UNSUPPORTED_FORMAT_HINTS: &[&str] = &[
    "unsupported",
    "invalid data found",
    "unknown format",
    "could not find codec",
];
const INVALID_AUDIO_HINTS: &[&str] = &[
    "failed to load audio",
    "no such file",
    "empty audio",
    "invalid audio",
    "decod",
];
const MODEL_HINTS: &[&str] = &["model", "checkpoint", "weights", "hf_token"];

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn cancelled() -> Self {
        Self::new(EngineErrorKind::Cancelled, "transcription cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Internal, message)
    }

    /// Classify an opaque engine message (stderr output, library error text).
    /// Memory exhaustion wins over every other hint.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let matches = |hints: &[&str]| hints.iter().any(|hint| lower.contains(hint));

        let kind = if matches(OUT_OF_MEMORY_HINTS) {
            EngineErrorKind::OutOfMemory
        } else if matches(UNSUPPORTED_FORMAT_HINTS) {
            EngineErrorKind::UnsupportedFormat
        } else if matches(INVALID_AUDIO_HINTS) {
            EngineErrorKind::InvalidAudio
        } else if matches(MODEL_HINTS) {
            EngineErrorKind::Model
        } else {
            EngineErrorKind::Internal
        };

        Self { kind, message }
    }
}

#[cfg(feature = "whisper")]
impl From<whisper_rs::WhisperError> for EngineError {
    fn from(error: whisper_rs::WhisperError) -> Self {
        EngineError::classify(format!("whisper error: {}", error))
    }
}
