//! Subtitle timing optimization.

use clip_types::TranslatedSegment;

use crate::config::SubtitleConfig;

/// Stretch too-short cues to the minimum display duration while keeping
/// the ordering and at least `min_gap_s` between consecutive cues.
///
/// Start times are never moved; only end times stretch (for readability)
/// or shrink (to preserve the inter-cue gap, which wins over the minimum
/// duration when the two conflict).
pub fn optimize_timing(segments: &mut [TranslatedSegment], config: &SubtitleConfig) {
    for segment in segments.iter_mut() {
        if segment.end_s - segment.start_s < config.min_display_s {
            segment.end_s = segment.start_s + config.min_display_s;
        }
    }

    for i in 0..segments.len().saturating_sub(1) {
        let next_start = segments[i + 1].start_s;
        let limit = next_start - config.min_gap_s;
        if segments[i].end_s > limit {
            segments[i].end_s = limit.max(segments[i].start_s);
        }
    }
}
