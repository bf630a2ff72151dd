//! Stage input/output artifacts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Portrait-oriented frames are treated as short-form material.
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The fetched source video, as returned by the fetcher collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub path: PathBuf,
    pub title: String,
    pub video_id: String,
    pub duration_s: f64,
    pub resolution: Resolution,
    pub is_short: bool,
}

/// Extracted audio track (16 kHz mono PCM for the transcriber).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub duration_s: f64,
}

/// Subtitle container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    Srt,
    Ass,
    Vtt,
}

impl SubtitleFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Ass => "ass",
            Self::Vtt => "vtt",
        }
    }
}

impl std::fmt::Display for SubtitleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// A written subtitle file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleArtifact {
    pub path: PathBuf,
    pub format: SubtitleFormat,
}

/// An edited/encoded output video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditedVideo {
    pub path: PathBuf,
    pub duration_s: f64,
    pub resolution: Resolution,
    pub bytes: u64,
}

/// Kind of file an export plan entry produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Video,
    Subtitle,
}

/// One derivative file the export stage will produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPlanEntry {
    pub kind: ExportKind,
    pub target: PathBuf,
    pub estimated_bytes: u64,
}

/// Enumeration of derivative files to produce, built once at export start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPlan {
    pub entries: Vec<ExportPlanEntry>,
}

impl ExportPlan {
    pub fn estimated_total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.estimated_bytes).sum()
    }
}

/// Final output listing of the export stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub videos: Vec<EditedVideo>,
    pub subtitles: Vec<SubtitleArtifact>,
    pub elapsed_s: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::new(1920, 1080).to_string(), "1920x1080");
    }

    #[test]
    fn test_portrait_detection() {
        assert!(Resolution::new(1080, 1920).is_portrait());
        assert!(!Resolution::new(1920, 1080).is_portrait());
    }

    #[test]
    fn test_subtitle_extension() {
        assert_eq!(SubtitleFormat::Srt.extension(), "srt");
        assert_eq!(SubtitleFormat::Ass.to_string(), "ass");
    }

    #[test]
    fn test_plan_total() {
        let plan = ExportPlan {
            entries: vec![
                ExportPlanEntry {
                    kind: ExportKind::Video,
                    target: "/out/a.mp4".into(),
                    estimated_bytes: 100,
                },
                ExportPlanEntry {
                    kind: ExportKind::Subtitle,
                    target: "/out/a.srt".into(),
                    estimated_bytes: 10,
                },
            ],
        };
        assert_eq!(plan.estimated_total_bytes(), 110);
    }
}
