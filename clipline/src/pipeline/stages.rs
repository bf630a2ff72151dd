//! Stage artifact persistence and the user-selection contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use clip_types::{
    AnalysisResult, AudioArtifact, EditSegment, EditedVideo, ExportResult, Selection,
    SubtitleArtifact, TranscriptionResult, TranslatedSegment, VideoArtifact,
};
use serde::{Deserialize, Serialize};

/// File under the run directory holding the artifact snapshot.
pub const ARTIFACTS_FILE: &str = "artifacts.json";

/// Stage outputs persisted at stage boundaries (and on cancellation) so a
/// resumed run re-enters with the same inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactStore {
    pub video: Option<VideoArtifact>,
    pub audio: Option<AudioArtifact>,
    pub transcription: Option<TranscriptionResult>,
    pub analysis: Option<AnalysisResult>,
    pub selection: Option<Selection>,
    /// Per-segment translations keyed by segment id; later writes win.
    #[serde(default)]
    pub translations: BTreeMap<u32, TranslatedSegment>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleArtifact>,
    #[serde(default)]
    pub edited: Vec<EditedVideo>,
    pub export: Option<ExportResult>,
}

impl ArtifactStore {
    /// Translations ordered by the transcript's segment order.
    pub fn ordered_translations(&self) -> Vec<TranslatedSegment> {
        match &self.transcription {
            Some(transcription) => transcription
                .segments
                .iter()
                .filter_map(|s| self.translations.get(&s.id).cloned())
                .collect(),
            None => self.translations.values().cloned().collect(),
        }
    }
}

/// The externally provided selection callback for the await-selection
/// stage. Returning `None` leaves the run parked at that stage.
#[async_trait]
pub trait SelectionHandler: Send + Sync {
    async fn select(
        &self,
        analysis: &AnalysisResult,
        transcription: &TranscriptionResult,
    ) -> Option<Selection>;
}

/// Non-interactive selection: keep the whole video as one span.
pub struct AutoSelection;

#[async_trait]
impl SelectionHandler for AutoSelection {
    async fn select(
        &self,
        _analysis: &AnalysisResult,
        transcription: &TranscriptionResult,
    ) -> Option<Selection> {
        Some(Selection {
            edit_segments: vec![EditSegment::span(1, 0.0, transcription.duration_s)],
        })
    }
}
