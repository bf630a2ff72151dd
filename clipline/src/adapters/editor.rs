//! ffmpeg-based video editing and encoding.

use std::path::Path;

use async_trait::async_trait;
use clip_types::{EditSegment, EditedVideo, Resolution};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::run_with_cancel;
use super::{EditError, EditOutput, VideoEditor};

/// Cuts and concatenates the curated segments with a single ffmpeg filter
/// graph, optionally burning in subtitles.
pub struct FfmpegVideoEditor {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegVideoEditor {
    pub fn new() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }

    /// Build the `-filter_complex` expression: per-segment trim + retiming,
    /// then concat, then the optional subtitle burn-in.
    pub fn build_filter(segments: &[EditSegment], subtitle: Option<&Path>) -> String {
        let mut parts = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            parts.push(format!(
                "[0:v]trim=start={s}:end={e},setpts=(PTS-STARTPTS)/{speed}[v{i}]",
                s = segment.start_s,
                e = segment.end_s,
                speed = segment.speed,
            ));
            parts.push(format!(
                "[0:a]atrim=start={s}:end={e},asetpts=PTS-STARTPTS,atempo={speed}[a{i}]",
                s = segment.start_s,
                e = segment.end_s,
                speed = clamp_atempo(segment.speed),
            ));
        }

        let inputs: String = (0..segments.len())
            .map(|i| format!("[v{i}][a{i}]"))
            .collect();
        let concat_out = if subtitle.is_some() { "[vc]" } else { "[vout]" };
        parts.push(format!(
            "{inputs}concat=n={}:v=1:a=1{concat_out}[aout]",
            segments.len()
        ));

        if let Some(subtitle) = subtitle {
            parts.push(format!(
                "[vc]subtitles={}[vout]",
                escape_filter_path(subtitle)
            ));
        }

        parts.join(";")
    }

    async fn probe_output(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(f64, Resolution), EditError> {
        let mut command = Command::new(&self.ffprobe);
        command.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height:format=duration",
            "-of",
            "csv=p=0",
        ]);
        command.arg(path);

        let output = run_with_cancel(command, cancel)
            .await
            .map_err(|e| EditError::EncodingFailed(format!("spawning ffprobe: {e}")))?
            .ok_or(EditError::Cancelled)?;

        let mut width = 0u32;
        let mut height = 0u32;
        let mut duration = 0.0f64;
        for line in output.stdout.lines() {
            let fields: Vec<&str> = line.trim().split(',').collect();
            match fields.as_slice() {
                [w, h] => {
                    width = w.parse().unwrap_or(0);
                    height = h.parse().unwrap_or(0);
                }
                [d] => duration = d.parse().unwrap_or(0.0),
                _ => {}
            }
        }
        Ok((duration, Resolution::new(width, height)))
    }

    fn classify_failure(stderr: &str) -> EditError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("no space left") {
            EditError::DiskSpace
        } else if lowered.contains("hwaccel") || lowered.contains("cuda") {
            EditError::HwAccelFailed
        } else {
            EditError::EncodingFailed(stderr.to_string())
        }
    }
}

impl Default for FfmpegVideoEditor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoEditor for FfmpegVideoEditor {
    async fn edit(
        &self,
        video: &Path,
        segments: &[EditSegment],
        output: &EditOutput,
        cancel: &CancellationToken,
    ) -> Result<EditedVideo, EditError> {
        if segments.is_empty() {
            return Err(EditError::InvalidSegment("no segments selected".into()));
        }
        for segment in segments {
            if !segment.is_well_formed() {
                return Err(EditError::InvalidSegment(format!(
                    "segment {} has invalid bounds or speed",
                    segment.id
                )));
            }
        }

        if let Some(parent) = output.target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EditError::EncodingFailed(format!("creating output dir: {e}")))?;
        }

        let filter = Self::build_filter(segments, output.subtitle.as_deref());
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-y", "-hide_banner", "-nostats", "-loglevel", "error"])
            .arg("-i")
            .arg(video)
            .args(["-filter_complex", &filter])
            .args(["-map", "[vout]", "-map", "[aout]"]);
        command.arg(&output.target);

        info!(
            video = %video.display(),
            target = %output.target.display(),
            segments = segments.len(),
            "encoding edited video"
        );
        let result = run_with_cancel(command, cancel)
            .await
            .map_err(|e| EditError::EncodingFailed(format!("spawning ffmpeg: {e}")))?
            .ok_or(EditError::Cancelled)?;

        if !result.success() {
            return Err(Self::classify_failure(&result.stderr_tail()));
        }

        let bytes = tokio::fs::metadata(&output.target)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let (duration_s, resolution) = self.probe_output(&output.target, cancel).await?;
        debug!(duration_s, bytes, "encode finished");

        Ok(EditedVideo {
            path: output.target.clone(),
            duration_s,
            resolution,
            bytes,
        })
    }
}

/// ffmpeg's atempo filter accepts 0.5..=100.0.
fn clamp_atempo(speed: f64) -> f64 {
    speed.clamp(0.5, 100.0)
}

/// Escape a path for use inside a filter expression.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}
