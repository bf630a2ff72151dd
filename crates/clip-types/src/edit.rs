//! User-curated edit selection.

use serde::{Deserialize, Serialize};

/// Transition applied at the start of an edit segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    #[default]
    Cut,
    Fade,
    Dissolve,
}

/// One curated span of the source video to keep in the edited output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSegment {
    pub id: u32,
    pub start_s: f64,
    pub end_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// How long the overlay title stays on screen; `>= 0`.
    #[serde(default)]
    pub title_duration_s: f64,
    #[serde(default)]
    pub transition: Transition,
    /// Playback speed multiplier; `> 0`.
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

impl EditSegment {
    /// A plain full-span cut with no overlay title.
    pub fn span(id: u32, start_s: f64, end_s: f64) -> Self {
        Self {
            id,
            start_s,
            end_s,
            title: None,
            title_duration_s: 0.0,
            transition: Transition::Cut,
            speed: 1.0,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.speed > 0.0 && self.title_duration_s >= 0.0 && self.start_s <= self.end_s
    }

    /// Output duration after the speed multiplier is applied.
    pub fn output_duration_s(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0) / self.speed
    }
}

/// The user's curated selection, gathered at the await-selection stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub edit_segments: Vec<EditSegment>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.edit_segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_is_well_formed() {
        assert!(EditSegment::span(1, 0.0, 10.0).is_well_formed());
    }

    #[test]
    fn test_zero_speed_rejected() {
        let mut seg = EditSegment::span(1, 0.0, 10.0);
        seg.speed = 0.0;
        assert!(!seg.is_well_formed());
    }

    #[test]
    fn test_output_duration_respects_speed() {
        let mut seg = EditSegment::span(1, 0.0, 10.0);
        seg.speed = 2.0;
        assert_eq!(seg.output_duration_s(), 5.0);
    }
}
