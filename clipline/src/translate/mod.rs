//! Segment translation through the LLM router.
//!
//! Segments are chunked under a token budget, translated per chunk, and
//! retried individually when a whole chunk fails. The stage continues on
//! partial success; failed segments fall back to their original text and
//! carry a quality flag.

pub mod batcher;
pub mod quality;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use clip_types::{Segment, TranslatedSegment};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TranslationConfig;
use crate::llm::{LlmError, LlmRouter, ResponseSchema, TaskKind};

pub use batcher::{chunk_segments, estimate_tokens, Chunk};
pub use quality::{
    QualityReport, FLAG_LOW_CONFIDENCE, FLAG_OVERSIZED_SEGMENT, FLAG_TRANSLATION_FAILED,
};

/// Language code to display-name mapping used in prompts.
const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("ja", "Japanese"),
    ("en", "English"),
    ("zh", "Chinese"),
    ("ko", "Korean"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
    ("vi", "Vietnamese"),
    ("th", "Thai"),
    ("id", "Indonesian"),
];

const BATCH_PROMPT: &str = "Translate the numbered segments below from {source_lang} to {target_lang}.

Rules:
- Maintain the original meaning and nuance
- Keep proper nouns as-is when appropriate
- Use natural {target_lang} expressions
- Lines marked (context) are for context ONLY; do not translate them
- Return a JSON object mapping each segment id to its translation,
  e.g. {\"12\": \"...\", \"13\": \"...\"}
- Return ONLY valid JSON, no other text

Segments:
{segments}";

const SINGLE_PROMPT: &str = "Translate the following text from {source_lang} to {target_lang}.

Rules:
- Maintain the original meaning and nuance
- Keep proper nouns as-is when appropriate
- Use natural {target_lang} expressions
- Return ONLY the translation, no explanations

Text to translate:
{text}";

/// Aggregate outcome of translating a set of segments.
#[derive(Debug, Clone, Default)]
pub struct PartialTranslationResult {
    pub successful: Vec<TranslatedSegment>,
    pub failed: Vec<TranslatedSegment>,
    pub success_rate: f64,
}

impl PartialTranslationResult {
    pub fn from_parts(
        successful: Vec<TranslatedSegment>,
        failed: Vec<TranslatedSegment>,
    ) -> Self {
        let total = successful.len() + failed.len();
        let success_rate = if total == 0 {
            1.0
        } else {
            successful.len() as f64 / total as f64
        };
        Self {
            successful,
            failed,
            success_rate,
        }
    }

    /// All segments, successes and flagged failures alike.
    pub fn all_segments(&self) -> Vec<TranslatedSegment> {
        let mut all = self.successful.clone();
        all.extend(self.failed.iter().cloned());
        all
    }
}

/// Chunk-level translator.
pub struct Translator {
    router: Arc<LlmRouter>,
    config: TranslationConfig,
    target_language: String,
}

impl Translator {
    pub fn new(
        router: Arc<LlmRouter>,
        config: TranslationConfig,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            router,
            config,
            target_language: target_language.into(),
        }
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    /// Partition pending segments into token-bounded chunks.
    pub fn chunks(&self, segments: &[Segment]) -> Vec<Chunk> {
        chunk_segments(segments, &self.config)
    }

    /// Translate one chunk. Returns the segments the model actually
    /// covered; missing ids are the caller's to retry individually.
    pub async fn translate_chunk(
        &self,
        chunk: &Chunk,
        source_language: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslatedSegment>, LlmError> {
        let prompt = self.batch_prompt(chunk, source_language);
        let value = self
            .router
            .execute(TaskKind::Translation, &prompt, ResponseSchema::TranslationMap, cancel)
            .await?;

        let Value::Object(map) = value else {
            return Err(LlmError::BadResponse {
                reason: "translation response was not an object".to_string(),
            });
        };

        let by_id: BTreeMap<u32, String> = map
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.parse::<u32>().ok()?;
                let text = value.as_str()?.to_string();
                Some((id, text))
            })
            .collect();

        let mut out = Vec::new();
        for segment in &chunk.segments {
            // Translations for context-only ids are dropped here; the chunk
            // that owns those ids produces the authoritative result.
            if let Some(text) = by_id.get(&segment.id) {
                out.push(self.finalize(segment, text.clone(), chunk.oversized));
            }
        }
        debug!(
            requested = chunk.segments.len(),
            translated = out.len(),
            "chunk translated"
        );
        Ok(out)
    }

    /// Translate a chunk end to end: the batch request first, then an
    /// individual retry for every segment the batch left uncovered.
    /// Permanent failures come back flagged with the original text, so
    /// every chunk segment is accounted for in the result. Only
    /// cancellation surfaces as an error.
    pub async fn translate_chunk_with_fallback(
        &self,
        chunk: &Chunk,
        source_language: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslatedSegment>, LlmError> {
        let mut out = Vec::with_capacity(chunk.segments.len());
        let mut missing: Vec<Segment> = Vec::new();

        match self.translate_chunk(chunk, source_language, cancel).await {
            Ok(translated) => {
                let got: BTreeSet<u32> = translated.iter().map(|t| t.id).collect();
                missing = chunk
                    .segments
                    .iter()
                    .filter(|s| !got.contains(&s.id))
                    .cloned()
                    .collect();
                out.extend(translated);
            }
            Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
            Err(e) => {
                warn!(error = %e, "chunk translation failed, retrying segments individually");
                missing = chunk.segments.clone();
            }
        }

        for segment in missing {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            match self.translate_single(&segment, source_language, cancel).await {
                Ok(translated) => out.push(translated),
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(_) => out.push(self.failed_segment(&segment)),
            }
        }
        Ok(out)
    }

    /// Translate one segment on its own (chunk-failure fallback path).
    pub async fn translate_single(
        &self,
        segment: &Segment,
        source_language: &str,
        cancel: &CancellationToken,
    ) -> Result<TranslatedSegment, LlmError> {
        let prompt = SINGLE_PROMPT
            .replace("{source_lang}", language_name(source_language))
            .replace("{target_lang}", language_name(&self.target_language))
            .replace("{text}", &segment.text);

        let value = self
            .router
            .execute(TaskKind::Translation, &prompt, ResponseSchema::FreeText, cancel)
            .await?;
        let text = value.as_str().unwrap_or_default().to_string();
        if text.trim().is_empty() {
            return Err(LlmError::BadResponse {
                reason: "empty translation".to_string(),
            });
        }
        Ok(self.finalize(segment, text, false))
    }

    /// The flagged fallback carrying the original text.
    pub fn failed_segment(&self, segment: &Segment) -> TranslatedSegment {
        warn!(segment_id = segment.id, "segment translation failed permanently");
        TranslatedSegment {
            id: segment.id,
            original: segment.text.clone(),
            translated: segment.text.clone(),
            start_s: segment.start_s,
            end_s: segment.end_s,
            quality_flags: vec![FLAG_TRANSLATION_FAILED.to_string()],
        }
    }

    fn finalize(&self, segment: &Segment, translated: String, oversized: bool) -> TranslatedSegment {
        let report = quality::validate(
            &segment.text,
            &translated,
            &self.target_language,
            &self.config,
        );
        let mut quality_flags = report.flags;
        if oversized {
            quality_flags.push(FLAG_OVERSIZED_SEGMENT.to_string());
        }
        TranslatedSegment {
            id: segment.id,
            original: segment.text.clone(),
            translated,
            start_s: segment.start_s,
            end_s: segment.end_s,
            quality_flags,
        }
    }

    fn batch_prompt(&self, chunk: &Chunk, source_language: &str) -> String {
        let mut lines = Vec::with_capacity(chunk.context.len() + chunk.segments.len());
        for segment in &chunk.context {
            lines.push(format!("{}. (context) {}", segment.id, segment.text));
        }
        for segment in &chunk.segments {
            lines.push(format!("{}. {}", segment.id, segment.text));
        }
        BATCH_PROMPT
            .replace("{source_lang}", language_name(source_language))
            .replace("{target_lang}", language_name(&self.target_language))
            .replace("{segments}", &lines.join("\n"))
    }
}

fn language_name(code: &str) -> &str {
    LANGUAGE_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or(code)
}
