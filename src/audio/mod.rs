use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use rayon::prelude::*;
use std::fs;
use anyhow::Result;
use tracing::{info, error};

pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// 解析音频文件并转换为引擎输入
///
/// Decodes `path` into mono `f32` samples in [-1, 1] at 16 kHz.
///
/// Non-WAV input is converted with ffmpeg first; the intermediate file is
/// removed before returning.
pub fn parse_audio_file(path: &Path) -> Result<Vec<f32>> {
    let (wav_path, converted) = ensure_wav_format(path)?;
    let decoded = read_wav_file(&wav_path);

    if converted {
        if let Err(e) = fs::remove_file(&wav_path) {
            error!("Failed to remove temporary WAV file: {}", e);
        } else {
            info!("Removed temporary WAV file: {:?}", wav_path);
        }
    }

    let (samples, num_channels, sample_rate) = decoded?;
    if samples.is_empty() {
        return Err(anyhow::anyhow!("empty audio: no samples in {}", path.display()));
    }

    let mono_samples = convert_to_mono(&samples, num_channels);
    let normalized_samples = normalize_audio(&mono_samples);

    if sample_rate != TARGET_SAMPLE_RATE {
        resample_audio(&normalized_samples, sample_rate)
    } else {
        Ok(normalized_samples)
    }
}

/// Converts anything ffmpeg understands into 16-bit mono PCM WAV.
/// Returns the path to decode and whether it is a temporary file.
fn ensure_wav_format(path: &Path) -> Result<(PathBuf, bool)> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        return Ok((path.to_path_buf(), false));
    }

    let output_path = path.with_extension("pcm.wav");
    info!("Converting {} to WAV format...", path.display());

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(path)
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg(&output_path)
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

    if !output.status.success() {
        let _ = fs::remove_file(&output_path);
        return Err(anyhow::anyhow!(
            "FFmpeg conversion failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok((output_path, true))
}

/// Reads interleaved samples scaled to [-1, 1], the channel count and the sample rate.
fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;

    let spec = reader.spec();
    let num_channels = spec.channels as usize;
    let sample_rate = spec.sample_rate;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|val| val as f32 / i16::MAX as f32))
            .collect::<std::result::Result<Vec<f32>, _>>(),
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, _>>(),
        (format, bits) => {
            return Err(anyhow::anyhow!(
                "Unsupported WAV encoding: {:?} with {} bits per sample",
                format,
                bits
            ))
        }
    }
    .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?;

    info!("Original sample rate: {} Hz, {} channel(s)", sample_rate, num_channels);
    Ok((samples, num_channels, sample_rate))
}

fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples.par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// 归一化音频到 [-1, 1]
fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples.par_iter().map(|&s| s.abs()).reduce(|| 0.0, f32::max);
    if max_abs <= f32::EPSILON {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}

fn resample_audio(samples: &[f32], original_sample_rate: u32) -> Result<Vec<f32>> {
    info!("Resampling from {} Hz to {} Hz", original_sample_rate, TARGET_SAMPLE_RATE);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        TARGET_SAMPLE_RATE as f64 / original_sample_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create resampler: {}", e))?;

    let mut resampled = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| anyhow::anyhow!("Resampling failed: {}", e))?;

    Ok(resampled.swap_remove(0))
}
