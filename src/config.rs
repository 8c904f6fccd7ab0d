use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::asr::command::CommandConfig;
use crate::schedule::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// External whisperx CLI.
    WhisperX,
    /// In-process whisper.cpp, needs the `whisper` feature.
    Whisper,
}

impl FromStr for EngineKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whisperx" => Ok(EngineKind::WhisperX),
            "whisper" => Ok(EngineKind::Whisper),
            other => Err(format!("unknown engine: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: IpAddr,
    pub port: u16,
    pub log_dir: String,
    pub upload_dir: PathBuf,
    pub max_file_size_mb: u64,

    pub engine: EngineKind,
    pub model_path: String,
    pub whisperx_cmd: String,
    pub whisperx_model: String,
    pub device: String,
    pub compute_type: String,
    pub batch_size: u32,
    pub hf_token: Option<String>,

    pub max_concurrent_tasks: usize,
    pub max_backlog: usize,
    pub queue_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub cleanup_after_hours: u64,
    pub cleanup_interval_secs: u64,
}

/// Process environment first, then `.env`.
fn lookup(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
    .filter(|value| !value.trim().is_empty())
}

fn string_or(key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid value {:?} for {}: {}, using default", raw, key, e);
            default
        }),
        None => default,
    }
}

/// Resolved before [`Settings`] so that settings warnings reach the log.
pub fn log_dir() -> String {
    string_or("ASR_LOG_DIR", "./logs")
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            host: parse_or("ASR_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: parse_or("ASR_PORT", 8000),
            log_dir: log_dir(),
            upload_dir: PathBuf::from(string_or("ASR_UPLOAD_DIR", "./asr_data/uploads")),
            max_file_size_mb: parse_or("ASR_MAX_FILE_SIZE_MB", 500),

            engine: parse_or("ASR_ENGINE", EngineKind::WhisperX),
            model_path: string_or("ASR_MODEL_PATH", "./models/ggml-large-v3.bin"),
            whisperx_cmd: string_or("ASR_WHISPERX_CMD", "whisperx"),
            whisperx_model: string_or("ASR_WHISPERX_MODEL", "large-v2"),
            device: string_or("ASR_DEVICE", "cuda"),
            compute_type: string_or("ASR_COMPUTE_TYPE", "float16"),
            batch_size: parse_or("ASR_BATCH_SIZE", 16),
            hf_token: lookup("HF_TOKEN"),

            max_concurrent_tasks: parse_or("MAX_CONCURRENT_TASKS", 2),
            max_backlog: parse_or("MAX_BACKLOG", 32),
            queue_timeout_secs: parse_or("QUEUE_TIMEOUT_SECS", 1800),
            task_timeout_secs: parse_or("TASK_TIMEOUT_SECS", 3600),
            cleanup_after_hours: parse_or("CLEANUP_AFTER_HOURS", 24),
            cleanup_interval_secs: parse_or("CLEANUP_INTERVAL_SECS", 3600),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_tasks: self.max_concurrent_tasks.max(1),
            max_backlog: self.max_backlog.max(1),
            queue_timeout: seconds(self.queue_timeout_secs),
            task_timeout: seconds(self.task_timeout_secs),
            cleanup_after: Duration::from_secs(self.cleanup_after_hours.saturating_mul(3600)),
            cleanup_interval: seconds(self.cleanup_interval_secs),
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            command: self.whisperx_cmd.split_whitespace().map(str::to_string).collect(),
            model: self.whisperx_model.clone(),
            device: self.device.clone(),
            compute_type: self.compute_type.clone(),
            batch_size: self.batch_size,
            hf_token: self.hf_token.clone(),
            work_dir: self.upload_dir.join("work"),
        }
    }
}
