//! Analysis artifacts produced by the LLM-backed analyzer.

use serde::{Deserialize, Serialize};

/// A detected highlight, expressed as a span of segment ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub start_segment_id: u32,
    /// Inclusive; always `>= start_segment_id`.
    pub end_segment_id: u32,
    /// Importance score in `0..=100`.
    pub score: u8,
    pub reason: String,
    pub category: String,
    pub suggested_title: String,
}

impl Highlight {
    pub fn segment_span(&self) -> std::ops::RangeInclusive<u32> {
        self.start_segment_id..=self.end_segment_id
    }
}

/// A detected chapter.
///
/// Chapters are non-overlapping and ordered; across all chapters the
/// `segment_ids` cover every segment exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: u32,
    pub start_s: f64,
    pub end_s: f64,
    pub title: String,
    pub summary: String,
    pub segment_ids: Vec<u32>,
}

/// Aggregate output of the analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub highlights: Vec<Highlight>,
    pub chapters: Vec<Chapter>,
    pub summary: String,
    pub title_candidates: Vec<String>,
}
