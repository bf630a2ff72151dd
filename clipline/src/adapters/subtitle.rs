//! Built-in subtitle writer.
//!
//! A compact serializer for SRT, VTT and ASS. Fancier typesetting belongs
//! to external tooling; this writer covers the formats the pipeline emits
//! by default.

use std::path::Path;

use async_trait::async_trait;
use clip_types::{SubtitleArtifact, SubtitleFormat, TranslatedSegment};
use tracing::info;

use super::{SubtitleError, SubtitleWriter};

/// Visual style applied to ASS output.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleStyle {
    pub font_name: String,
    pub font_size: u32,
    /// Primary text color as `&HAABBGGRR` ASS notation.
    pub primary_color: String,
    pub outline_width: f32,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_name: "Noto Sans CJK JP".to_string(),
            font_size: 48,
            primary_color: "&H00FFFFFF".to_string(),
            outline_width: 2.0,
        }
    }
}

/// Writes subtitle files directly, without external tools.
#[derive(Debug, Default)]
pub struct BuiltinSubtitleWriter;

#[async_trait]
impl SubtitleWriter for BuiltinSubtitleWriter {
    async fn write(
        &self,
        segments: &[TranslatedSegment],
        style: &SubtitleStyle,
        format: SubtitleFormat,
        output: &Path,
    ) -> Result<SubtitleArtifact, SubtitleError> {
        let body = match format {
            SubtitleFormat::Srt => render_srt(segments),
            SubtitleFormat::Vtt => render_vtt(segments),
            SubtitleFormat::Ass => render_ass(segments, style),
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SubtitleError::WriteFailed(e.to_string()))?;
        }
        tokio::fs::write(output, body)
            .await
            .map_err(|e| SubtitleError::WriteFailed(e.to_string()))?;

        info!(path = %output.display(), format = %format, count = segments.len(), "subtitles written");
        Ok(SubtitleArtifact {
            path: output.to_path_buf(),
            format,
        })
    }
}

fn render_srt(segments: &[TranslatedSegment]) -> String {
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            srt_timestamp(segment.start_s),
            srt_timestamp(segment.end_s),
            segment.translated
        ));
    }
    out
}

fn render_vtt(segments: &[TranslatedSegment]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for segment in segments {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            vtt_timestamp(segment.start_s),
            vtt_timestamp(segment.end_s),
            segment.translated
        ));
    }
    out
}

fn render_ass(segments: &[TranslatedSegment], style: &SubtitleStyle) -> String {
    let mut out = String::new();
    out.push_str("[Script Info]\nScriptType: v4.00+\nWrapStyle: 0\n\n");
    out.push_str("[V4+ Styles]\n");
    out.push_str(
        "Format: Name, Fontname, Fontsize, PrimaryColour, OutlineColour, \
         Outline, Alignment, MarginV\n",
    );
    out.push_str(&format!(
        "Style: Default,{},{},{},&H00000000,{},2,40\n\n",
        style.font_name, style.font_size, style.primary_color, style.outline_width
    ));
    out.push_str("[Events]\nFormat: Layer, Start, End, Style, Text\n");
    for segment in segments {
        out.push_str(&format!(
            "Dialogue: 0,{},{},Default,{}\n",
            ass_timestamp(segment.start_s),
            ass_timestamp(segment.end_s),
            segment.translated.replace('\n', "\\N")
        ));
    }
    out
}

fn srt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_time(seconds);
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

fn vtt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_time(seconds);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn ass_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_time(seconds);
    format!("{h}:{m:02}:{s:02}.{:02}", ms / 10)
}

fn split_time(seconds: f64) -> (u64, u64, u64, u64) {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    (total_s / 3600, (total_s / 60) % 60, total_s % 60, ms)
}
