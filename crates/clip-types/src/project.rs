//! The in-memory project value handed to the container writer.

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisResult;
use crate::artifact::{ExportResult, SubtitleArtifact, VideoArtifact};
use crate::segment::{TranscriptionResult, TranslatedSegment};

/// Everything a completed run produced.
///
/// Serialization of the project container is a collaborator responsibility;
/// the pipeline only builds and returns this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub run_id: String,
    pub source_url: String,
    pub video: VideoArtifact,
    pub transcription: TranscriptionResult,
    pub analysis: AnalysisResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<Vec<TranslatedSegment>>,
    pub subtitles: Vec<SubtitleArtifact>,
    pub exports: ExportResult,
}
