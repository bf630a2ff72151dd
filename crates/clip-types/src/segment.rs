//! Transcript segments and their translated counterparts.

use serde::{Deserialize, Serialize};

/// Timing of a single recognized word within a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_s: f64,
    pub end_s: f64,
    pub confidence: f32,
}

/// One transcript segment.
///
/// Segment ids are unique within a run and the segment sequence is ordered
/// by `start_s`. Words cover `[start_s, end_s]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<WordTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl Segment {
    pub fn duration_s(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0)
    }

    /// Check the per-segment invariant (`start_s <= end_s`).
    pub fn is_well_formed(&self) -> bool {
        self.start_s <= self.end_s
    }
}

/// Output of the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub segments: Vec<Segment>,
    /// Detected (or forced) source language code, e.g. "en".
    pub language: String,
    /// Total audio duration in seconds.
    pub duration_s: f64,
}

impl TranscriptionResult {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// A segment after translation.
///
/// `id` equals the source [`Segment::id`]. Segments whose translation failed
/// carry the original text in `translated` together with a quality flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedSegment {
    pub id: u32,
    pub original: String,
    pub translated: String,
    pub start_s: f64,
    pub end_s: f64,
    #[serde(default)]
    pub quality_flags: Vec<String>,
}

impl TranslatedSegment {
    pub fn is_flagged(&self) -> bool {
        !self.quality_flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u32, start_s: f64, end_s: f64) -> Segment {
        Segment {
            id,
            start_s,
            end_s,
            text: format!("segment {id}"),
            confidence: 0.9,
            words: Vec::new(),
            speaker: None,
        }
    }

    #[test]
    fn test_duration_never_negative() {
        assert_eq!(segment(1, 5.0, 4.0).duration_s(), 0.0);
        assert_eq!(segment(1, 1.0, 3.5).duration_s(), 2.5);
    }

    #[test]
    fn test_well_formed() {
        assert!(segment(1, 0.0, 1.0).is_well_formed());
        assert!(!segment(1, 2.0, 1.0).is_well_formed());
    }

    #[test]
    fn test_serde_roundtrip() {
        let seg = Segment {
            id: 7,
            start_s: 1.5,
            end_s: 3.0,
            text: "hello".into(),
            confidence: 0.87,
            words: vec![WordTiming {
                word: "hello".into(),
                start_s: 1.5,
                end_s: 3.0,
                confidence: 0.87,
            }],
            speaker: Some("spk0".into()),
        };
        let json = serde_json::to_string(&seg).unwrap();
        let parsed: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, seg);
    }
}
