//! Per-segment translation quality validation.

use crate::config::TranslationConfig;

/// Flag set on segments whose translation failed outright; downstream
/// stages fall back to the original text for these.
pub const FLAG_TRANSLATION_FAILED: &str = "translation_failed";
/// Flag set when a single segment exceeded the batch token budget.
pub const FLAG_OVERSIZED_SEGMENT: &str = "oversized_segment";
/// Flag set when post-validation confidence dropped below the threshold.
pub const FLAG_LOW_CONFIDENCE: &str = "low_confidence";
/// Flag set when the translated/original length ratio fell out of bounds.
pub const FLAG_LENGTH_RATIO: &str = "length_ratio_out_of_bounds";
/// Flag set when untranslated source script lingers in the output.
pub const FLAG_SOURCE_RESIDUE: &str = "source_residue";
/// Flag set when the output looks like an error marker, not a translation.
pub const FLAG_PLACEHOLDER: &str = "placeholder_detected";

/// Minimum run of consecutive ASCII letters that counts as source residue
/// in a non-alphabetic target language.
const RESIDUE_RUN_LEN: usize = 12;

/// Substrings that mark a refusal or error response instead of a
/// translation.
const PLACEHOLDER_MARKERS: &[&str] = &[
    "[translation",
    "<error",
    "i'm sorry",
    "i cannot",
    "as an ai",
    "error:",
];

/// Outcome of validating one translated segment.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub confidence: f32,
    pub flags: Vec<String>,
}

impl QualityReport {
    pub fn is_acceptable(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

/// Validate a translation against its source.
///
/// Confidence starts at 1.0; each violation degrades it. Segments below
/// the configured threshold are flagged but still included.
pub fn validate(
    original: &str,
    translated: &str,
    target_language: &str,
    config: &TranslationConfig,
) -> QualityReport {
    let mut confidence = 1.0f32;
    let mut flags = Vec::new();

    if is_placeholder(translated) {
        confidence = 0.0;
        flags.push(FLAG_PLACEHOLDER.to_string());
    }

    let original_len = original.chars().count().max(1);
    let translated_len = translated.chars().count();
    let ratio = translated_len as f64 / original_len as f64;
    if ratio < config.min_length_ratio || ratio > config.max_length_ratio {
        confidence *= 0.5;
        flags.push(FLAG_LENGTH_RATIO.to_string());
    }

    if !is_alphabetic_language(target_language) && has_source_residue(translated) {
        confidence *= 0.5;
        flags.push(FLAG_SOURCE_RESIDUE.to_string());
    }

    if confidence < config.confidence_threshold {
        flags.push(FLAG_LOW_CONFIDENCE.to_string());
    }

    QualityReport { confidence, flags }
}

fn is_placeholder(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let trimmed = lowered.trim();
    trimmed.is_empty() || PLACEHOLDER_MARKERS.iter().any(|m| trimmed.contains(m))
}

/// Target languages written in non-alphabetic scripts, where a long run of
/// ASCII letters suggests the source text leaked through.
fn is_alphabetic_language(language: &str) -> bool {
    !matches!(language, "ja" | "zh" | "ko" | "th")
}

fn has_source_residue(text: &str) -> bool {
    let mut run = 0usize;
    for ch in text.chars() {
        if ch.is_ascii_alphabetic() {
            run += 1;
            if run >= RESIDUE_RUN_LEN {
                return true;
            }
        } else if !ch.is_ascii_whitespace() {
            run = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TranslationConfig {
        TranslationConfig::default()
    }

    #[test]
    fn test_clean_translation_passes() {
        let report = validate("hello world", "こんにちは世界", "ja", &config());
        assert_eq!(report.confidence, 1.0);
        assert!(report.flags.is_empty());
        assert!(report.is_acceptable(0.7));
    }

    #[test]
    fn test_length_ratio_halves_confidence() {
        let report = validate(
            "a rather long sentence with many words in it",
            "短",
            "ja",
            &config(),
        );
        assert_eq!(report.confidence, 0.5);
        assert!(report.flags.contains(&FLAG_LENGTH_RATIO.to_string()));
        assert!(report.flags.contains(&FLAG_LOW_CONFIDENCE.to_string()));
    }

    #[test]
    fn test_source_residue_detected_for_ideographic_target() {
        let report = validate(
            "the transformation pipeline is here and running",
            "これは transformationpipeline です、動いています今",
            "ja",
            &config(),
        );
        assert!(report.flags.contains(&FLAG_SOURCE_RESIDUE.to_string()));
        assert!(report.confidence < 1.0);
    }

    #[test]
    fn test_residue_ignored_for_alphabetic_target() {
        let report = validate(
            "bonjour le monde entier",
            "hello to the wonderful world",
            "en",
            &config(),
        );
        assert!(!report.flags.contains(&FLAG_SOURCE_RESIDUE.to_string()));
    }

    #[test]
    fn test_placeholder_zeroes_confidence() {
        let report = validate("hello", "[TRANSLATION FAILED]", "ja", &config());
        assert_eq!(report.confidence, 0.0);
        assert!(report.flags.contains(&FLAG_PLACEHOLDER.to_string()));
        assert!(!report.is_acceptable(0.7));
    }

    #[test]
    fn test_empty_translation_is_placeholder() {
        let report = validate("hello", "   ", "ja", &config());
        assert_eq!(report.confidence, 0.0);
    }
}
