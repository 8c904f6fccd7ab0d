use std::path::Path;
use serde::{Serialize, Deserialize};
use async_trait::async_trait;

pub mod command;
pub mod error;
pub mod progress;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use error::{EngineError, EngineErrorKind};
pub use progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Default)]
pub struct AsrParams {
    pub language: Option<String>,
    pub speaker_diarization: bool,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

impl AsrParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language;
        self
    }

    pub fn set_speaker_diarization(&mut self, speaker_diarization: bool) -> &mut Self {
        self.speaker_diarization = speaker_diarization;
        self
    }

    pub fn set_speaker_range(&mut self, min_speakers: Option<u32>, max_speakers: Option<u32>) -> &mut Self {
        self.min_speakers = min_speakers;
        self.max_speakers = max_speakers;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub words: Vec<TranscriptWord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
}

/// A transcription backend.
///
/// `progress` may be reported any number of times with non-decreasing
/// percentages. Implementations should check [`ProgressSink::is_cancelled`]
/// between expensive stages and return [`EngineError::cancelled`] when set.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe(
        &self,
        audio_path: &Path,
        params: AsrParams,
        progress: ProgressSink,
    ) -> Result<Transcript, EngineError>;
}
