use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asr::{
    AsrEngine, AsrParams, EngineError, ProgressSink, Transcript, TranscriptSegment, TranscriptWord,
};

const STDERR_TAIL_LINES: usize = 5;

/// Configuration for an external whisperx-compatible command.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Program followed by leading arguments, e.g. `["python", "-m", "whisperx"]`.
    pub command: Vec<String>,
    pub model: String,
    pub device: String,
    pub compute_type: String,
    pub batch_size: u32,
    pub hf_token: Option<String>,
    /// Scratch space for per-run output directories.
    pub work_dir: PathBuf,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: vec!["whisperx".to_string()],
            model: "large-v2".to_string(),
            device: "cuda".to_string(),
            compute_type: "float16".to_string(),
            batch_size: 16,
            hf_token: None,
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Runs transcription in a child process and reads back its JSON transcript.
/// Cancellation kills the child.
pub struct CommandAsr {
    config: CommandConfig,
}

impl CommandAsr {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, audio_path: &Path, params: &AsrParams, output_dir: &Path) -> Result<Command, EngineError> {
        let (program, leading) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| EngineError::internal("transcription command is empty"))?;

        let mut command = Command::new(program);
        command
            .args(leading)
            .arg(audio_path)
            .arg("--model")
            .arg(&self.config.model)
            .arg("--device")
            .arg(&self.config.device)
            .arg("--compute_type")
            .arg(&self.config.compute_type)
            .arg("--batch_size")
            .arg(self.config.batch_size.to_string())
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--output_format")
            .arg("json")
            .arg("--print_progress")
            .arg("True");

        if let Some(language) = &params.language {
            command.arg("--language").arg(language);
        }

        if params.speaker_diarization {
            command.arg("--diarize");
            if let Some(token) = &self.config.hf_token {
                command.arg("--hf_token").arg(token);
            }
            if let Some(min) = params.min_speakers {
                command.arg("--min_speakers").arg(min.to_string());
            }
            if let Some(max) = params.max_speakers {
                command.arg("--max_speakers").arg(max.to_string());
            }
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(command)
    }

    async fn run(
        &self,
        audio_path: &Path,
        params: &AsrParams,
        output_dir: &Path,
        progress: &ProgressSink,
    ) -> Result<Transcript, EngineError> {
        let mut child = self
            .build_command(audio_path, params, output_dir)?
            .spawn()
            .map_err(|e| EngineError::internal(format!("failed to run {:?}: {}", self.config.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::internal("child stdout was not captured"))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = progress.cancelled() => return Err(kill(&mut child).await),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(percent) = parse_progress(&line) {
                            progress.report(10.0 + percent * 0.8, "transcribing");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read transcription output: {}", e);
                        break;
                    }
                },
            }
        }

        let waited = tokio::select! {
            _ = progress.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let status = match waited {
            Some(status) => status.map_err(|e| {
                EngineError::internal(format!("failed to wait for transcription command: {}", e))
            })?,
            None => return Err(kill(&mut child).await),
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let tail = stderr_tail(&stderr);
            warn!("Transcription command exited with {}: {}", status, tail);
            return Err(EngineError::classify(if tail.is_empty() {
                format!("transcription command exited with {}", status)
            } else {
                tail
            }));
        }

        progress.report(92.0, "processing");
        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());
        let output_path = output_dir.join(format!("{}.json", stem));
        let json = tokio::fs::read_to_string(&output_path).await.map_err(|e| {
            EngineError::internal(format!("missing transcript {}: {}", output_path.display(), e))
        })?;

        parse_output(&json, params.language.as_deref())
    }
}

async fn kill(child: &mut Child) -> EngineError {
    info!("Cancellation requested, killing transcription process");
    if let Err(e) = child.kill().await {
        warn!("Failed to kill transcription process: {}", e);
    }
    EngineError::cancelled()
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Extracts the percentage from a `Progress: 45.00%...` line.
fn parse_progress(line: &str) -> Option<f32> {
    let rest = line.split_once("Progress:")?.1;
    let number = rest.trim_start().split('%').next()?.trim();
    number.parse::<f32>().ok().filter(|p| p.is_finite())
}

#[derive(Debug, Deserialize)]
struct CommandOutput {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<CommandSegment>,
}

#[derive(Debug, Deserialize)]
struct CommandSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    words: Vec<CommandWord>,
}

#[derive(Debug, Deserialize)]
struct CommandWord {
    word: String,
    #[serde(default)]
    start: Option<f64>,
    #[serde(default)]
    end: Option<f64>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    speaker: Option<String>,
}

fn parse_output(json: &str, requested_language: Option<&str>) -> Result<Transcript, EngineError> {
    let output: CommandOutput = serde_json::from_str(json)
        .map_err(|e| EngineError::internal(format!("failed to parse transcript JSON: {}", e)))?;

    let language = output
        .language
        .or_else(|| requested_language.map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    let segments = output
        .segments
        .into_iter()
        .map(|seg| {
            // unaligned words (numbers, symbols) carry no timing; pin them to their neighbour
            let mut cursor = seg.start;
            let words = seg
                .words
                .into_iter()
                .map(|w| {
                    let start = w.start.unwrap_or(cursor);
                    let end = w.end.unwrap_or(start);
                    cursor = end;
                    TranscriptWord {
                        word: w.word,
                        start,
                        end,
                        score: w.score,
                        speaker: w.speaker,
                    }
                })
                .collect();

            TranscriptSegment {
                text: seg.text.trim().to_string(),
                start: seg.start,
                end: seg.end,
                speaker: seg.speaker,
                words,
            }
        })
        .collect();

    Ok(Transcript { language, segments })
}

#[async_trait]
impl AsrEngine for CommandAsr {
    fn name(&self) -> &'static str {
        "whisperx"
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        params: AsrParams,
        progress: ProgressSink,
    ) -> Result<Transcript, EngineError> {
        progress.report(5.0, "loading_audio");

        let output_dir = self.config.work_dir.join(format!("asr-run-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| EngineError::internal(format!("failed to create {}: {}", output_dir.display(), e)))?;
        debug!("Running transcription command for {} in {}", audio_path.display(), output_dir.display());

        let result = self.run(audio_path, &params, &output_dir, &progress).await;

        if let Err(e) = tokio::fs::remove_dir_all(&output_dir).await {
            warn!("Failed to remove {}: {}", output_dir.display(), e);
        }
        result
    }
}
