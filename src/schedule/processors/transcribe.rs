use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::asr::{AsrEngine, AsrParams, EngineError, ProgressSink, Transcript};
use crate::schedule::error::TaskError;
use crate::schedule::types::{
    Task, TaskConfig, TaskFailure, TranscribeOptions, TranscribeResult, TranscribeSegment,
    WordSegment,
};
use crate::storage::artifact;
use super::TaskProcessor;

#[derive(Clone)]
pub struct TranscribeProcessor {
    asr: Arc<dyn AsrEngine>,
}

impl TranscribeProcessor {
    pub fn new(asr: Arc<dyn AsrEngine>) -> Self {
        Self { asr }
    }

    fn asr_params(options: &TranscribeOptions) -> AsrParams {
        let mut params = AsrParams::new();
        params
            .set_language(options.language.clone())
            .set_speaker_diarization(options.enable_diarization)
            .set_speaker_range(options.min_speakers, options.max_speakers);
        params
    }
}

fn convert_transcript(transcript: Transcript) -> TranscribeResult {
    TranscribeResult {
        language: transcript.language,
        segments: transcript
            .segments
            .into_iter()
            .map(|s| TranscribeSegment {
                start: s.start,
                end: s.end,
                text: s.text.trim().to_string(),
                speaker: s.speaker,
                words: s
                    .words
                    .into_iter()
                    .map(|w| WordSegment {
                        word: w.word,
                        start: w.start,
                        end: w.end,
                        score: w.score,
                        speaker: w.speaker,
                    })
                    .collect(),
            })
            .collect(),
    }
}

impl From<EngineError> for TaskFailure {
    fn from(e: EngineError) -> Self {
        TaskFailure::new(e.kind.into(), e.message)
    }
}

#[async_trait]
impl TaskProcessor for TranscribeProcessor {
    fn name(&self) -> &'static str {
        self.asr.name()
    }

    fn validate_params(&self, config: &TaskConfig) -> Result<(), TaskError> {
        let options = &config.options;

        // language codes look like "en", "zh" or "yue"
        if let Some(lang) = &options.language {
            let valid = (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_lowercase());
            if !valid {
                return Err(TaskError::InvalidParams(format!("Unsupported language: {}", lang)));
            }
        }

        for (name, value) in [("min_speakers", options.min_speakers), ("max_speakers", options.max_speakers)] {
            if value == Some(0) {
                return Err(TaskError::InvalidParams(format!("{} must be at least 1", name)));
            }
        }
        if let (Some(min), Some(max)) = (options.min_speakers, options.max_speakers) {
            if min > max {
                return Err(TaskError::InvalidParams(format!(
                    "min_speakers ({}) is greater than max_speakers ({})",
                    min, max
                )));
            }
        }

        if !config.input_path.is_file() {
            return Err(TaskError::InvalidParams(format!(
                "Input file not found: {}",
                config.input_path.display()
            )));
        }
        Ok(())
    }

    async fn process(&self, task: &Task, progress: ProgressSink) -> Result<TranscribeResult, TaskFailure> {
        info!(
            "Processing transcribe task {} with {}: {}",
            task.id,
            self.asr.name(),
            task.config.input_path.display()
        );

        let params = Self::asr_params(&task.config.options);
        match self.asr.transcribe(&task.config.input_path, params, progress).await {
            Ok(transcript) => {
                info!("Successfully processed task {}", task.id);
                Ok(convert_transcript(transcript))
            }
            Err(e) => {
                warn!("Failed to process task {}: {}", task.id, e);
                Err(e.into())
            }
        }
    }

    async fn cleanup(&self, task: &Task) {
        artifact::release(&task.config.input_path).await;
    }
}
