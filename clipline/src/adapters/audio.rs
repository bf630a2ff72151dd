//! ffmpeg-based audio extraction.

use std::path::Path;

use async_trait::async_trait;
use clip_types::AudioArtifact;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::run_with_cancel;
use super::{AudioError, AudioExtractor};

/// Transcriber input format: 16 kHz mono 16-bit PCM.
const SAMPLE_RATE_HZ: u32 = 16_000;
const CHANNELS: u8 = 1;

/// Extracts the audio track of a video into a WAV file using ffmpeg.
pub struct FfmpegAudioExtractor {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegAudioExtractor {
    pub fn new() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }

    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Build the ffmpeg argument list for WAV extraction.
    pub fn build_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            SAMPLE_RATE_HZ.to_string(),
            "-ac".to_string(),
            CHANNELS.to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Check for an audio stream with ffprobe.
    async fn has_audio_stream(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, AudioError> {
        let mut command = Command::new(&self.ffprobe);
        command.args([
            "-v",
            "error",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
        ]);
        command.arg(input);

        let output = run_with_cancel(command, cancel)
            .await
            .map_err(|e| AudioError::ExtractionFailed(format!("spawning ffprobe: {e}")))?
            .ok_or(AudioError::Cancelled)?;
        Ok(output.stdout.trim() == "audio")
    }

    /// Probe the duration of a media file.
    async fn probe_duration(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<f64, AudioError> {
        let mut command = Command::new(&self.ffprobe);
        command.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ]);
        command.arg(input);

        let output = run_with_cancel(command, cancel)
            .await
            .map_err(|e| AudioError::ExtractionFailed(format!("spawning ffprobe: {e}")))?
            .ok_or(AudioError::Cancelled)?;
        Ok(output.stdout.trim().parse().unwrap_or(0.0))
    }
}

impl Default for FfmpegAudioExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract(
        &self,
        video: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact, AudioError> {
        if !self.has_audio_stream(video, cancel).await? {
            return Err(AudioError::NoAudioTrack);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| AudioError::ExtractionFailed(format!("creating output dir: {e}")))?;

        let stem = video
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let output = output_dir.join(format!("{stem}.wav"));

        info!(video = %video.display(), output = %output.display(), "extracting audio");
        let mut command = Command::new(&self.ffmpeg);
        command.args(Self::build_args(video, &output));

        let result = run_with_cancel(command, cancel)
            .await
            .map_err(|e| AudioError::ExtractionFailed(format!("spawning ffmpeg: {e}")))?
            .ok_or(AudioError::Cancelled)?;

        if !result.success() {
            let stderr = result.stderr_tail();
            if stderr.to_lowercase().contains("invalid data") {
                return Err(AudioError::FormatUnsupported);
            }
            return Err(AudioError::ExtractionFailed(stderr));
        }

        let duration_s = self.probe_duration(&output, cancel).await?;
        debug!(duration_s, "audio extracted");

        Ok(AudioArtifact {
            path: output,
            sample_rate_hz: SAMPLE_RATE_HZ,
            channels: CHANNELS,
            duration_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_requests_pcm_mono_16k() {
        let args = FfmpegAudioExtractor::build_args(Path::new("/in.mp4"), Path::new("/out.wav"));
        let joined = args.join(" ");
        assert!(joined.contains("-acodec pcm_s16le"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-vn"));
        assert!(joined.ends_with("/out.wav"));
    }
}
