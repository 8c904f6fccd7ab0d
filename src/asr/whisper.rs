use std::path::Path;
use std::sync::Arc;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::asr::{
    AsrEngine, AsrParams, EngineError, ProgressSink, Transcript, TranscriptSegment, TranscriptWord,
};
use crate::audio::parse_audio_file;

// whisper timestamps are in centiseconds
const TICKS_PER_SECOND: f64 = 100.0;

pub struct WhisperAsr {
    whisper_ctx: Arc<WhisperContext>,
    n_threads: i32,
}

impl WhisperAsr {
    pub fn new(model_path: String) -> Result<Self> {
        match WhisperContext::new_with_params(&model_path, WhisperContextParameters::default()) {
            Ok(whisper_ctx) => Ok(Self {
                whisper_ctx: Arc::new(whisper_ctx),
                n_threads: 8,
            }),
            Err(e) => Err(anyhow::anyhow!("failed to open whisper model: {}", e)),
        }
    }

    pub fn with_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }
}

fn build_params<'a, 'b>(ap: &AsrParams, language: &'a str, n_threads: i32, progress: ProgressSink) -> FullParams<'a, 'b> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

    params.set_language(Some(language));

    // 启用说话人分离
    params.set_tdrz_enable(ap.speaker_diarization);

    // word timings come from token timestamps
    params.set_token_timestamps(true);

    // 设置采样温度。较低的值会使输出更加确定，较高的值会增加随机性
    params.set_temperature(0.3);

    params.set_n_threads(n_threads);
    params.set_translate(false);
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);

    // 禁用无上下文模式。启用上下文可以提高长音频的识别准确度
    params.set_no_context(false);

    params.set_suppress_blank(true);
    params.set_suppress_non_speech_tokens(true);
    params.set_max_initial_ts(1.0);

    // whisper.cpp polls this between decoder steps
    let abort = progress.clone();
    params.set_abort_callback_safe(move || abort.is_cancelled());

    // inference covers 20%..90% of the overall run
    params.set_progress_callback_safe(move |percent: i32| {
        progress.report(20.0 + percent.clamp(0, 100) as f32 * 0.7, "transcribing");
    });

    params
}

fn run_inference(
    ctx: &WhisperContext,
    audio: &[f32],
    ap: &AsrParams,
    n_threads: i32,
    progress: ProgressSink,
) -> Result<Transcript, EngineError> {
    let mut state = ctx.create_state()?;
    let requested = ap.language.clone().unwrap_or_else(|| "auto".to_string());
    let cancel = progress.clone();
    let params = build_params(ap, &requested, n_threads, progress);

    if let Err(e) = state.full(params, audio) {
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled());
        }
        return Err(e.into());
    }

    let language = if requested == "auto" {
        let lang_id = state.full_lang_id_from_state()?;
        whisper_rs::get_lang_str(lang_id).unwrap_or("auto").to_string()
    } else {
        requested
    };

    let num_segments = state.full_n_segments()?;
    let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
    let mut current_speaker = 0;

    for i in 0..num_segments {
        let text = state.full_get_segment_text(i)?;
        let start = state.full_get_segment_t0(i)? as f64 / TICKS_PER_SECOND;
        let end = state.full_get_segment_t1(i)? as f64 / TICKS_PER_SECOND;

        if ap.speaker_diarization && i > 0 && state.full_get_segment_speaker_turn_next(i - 1) {
            current_speaker += 1;
        }
        let speaker = ap
            .speaker_diarization
            .then(|| format!("SPEAKER_{:02}", current_speaker));

        let mut words: Vec<TranscriptWord> = Vec::new();
        for j in 0..state.full_n_tokens(i)? {
            let Ok(piece) = state.full_get_token_text(i, j) else {
                continue;
            };
            // special tokens: [_BEG_], [_TT_xxx], <|en|> ...
            if piece.starts_with("[_") || piece.starts_with("<|") || piece.trim().is_empty() {
                continue;
            }
            let data = state.full_get_token_data(i, j)?;
            let token_start = data.t0 as f64 / TICKS_PER_SECOND;
            let token_end = data.t1 as f64 / TICKS_PER_SECOND;

            // BPE pieces without a leading space continue the previous word
            match words.last_mut() {
                Some(word) if !piece.starts_with(' ') => {
                    word.word.push_str(&piece);
                    word.end = token_end;
                }
                _ => words.push(TranscriptWord {
                    word: piece.trim().to_string(),
                    start: token_start,
                    end: token_end,
                    score: Some(data.p as f64),
                    speaker: speaker.clone(),
                }),
            }
        }

        segments.push(TranscriptSegment {
            text: text.trim().to_string(),
            start,
            end,
            speaker,
            words,
        });
    }

    Ok(Transcript { language, segments })
}

#[async_trait]
impl AsrEngine for WhisperAsr {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        params: AsrParams,
        progress: ProgressSink,
    ) -> Result<Transcript, EngineError> {
        if params.min_speakers.is_some() || params.max_speakers.is_some() {
            debug!("whisper tinydiarize ignores speaker count hints");
        }

        progress.report(5.0, "loading_audio");
        info!("Loading audio file: {}", audio_path.display());
        let path = audio_path.to_path_buf();
        let audio = tokio::task::spawn_blocking(move || parse_audio_file(&path))
            .await
            .map_err(|e| EngineError::internal(format!("audio decoding task failed: {}", e)))?
            .map_err(|e| EngineError::classify(format!("failed to load audio: {:#}", e)))?;

        if progress.is_cancelled() {
            return Err(EngineError::cancelled());
        }

        progress.report(20.0, "transcribing");
        let ctx = self.whisper_ctx.clone();
        let n_threads = self.n_threads;
        let sink = progress.clone();
        let transcript = tokio::task::spawn_blocking(move || {
            run_inference(&ctx, &audio, &params, n_threads, sink)
        })
        .await
        .map_err(|e| EngineError::internal(format!("whisper inference task failed: {}", e)))??;

        progress.report(95.0, "processing");
        info!(
            "Whisper transcription complete: {} segments, language {}",
            transcript.segments.len(),
            transcript.language
        );
        Ok(transcript)
    }
}
