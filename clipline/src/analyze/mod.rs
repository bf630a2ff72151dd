//! LLM-backed transcript analysis: highlights, chapters, summary, titles.

use std::sync::Arc;

use clip_types::{AnalysisResult, Chapter, Highlight, TranscriptionResult};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{LlmRouter, ResponseSchema, TaskKind};

/// Transcripts longer than this are truncated before prompting.
const MAX_TRANSCRIPT_CHARS: usize = 8000;

const HIGHLIGHT_PROMPT: &str = "Analyze the following transcript and identify key highlights \
(interesting moments, important information, funny parts).

Each transcript line is `<segment_id> [MM:SS] text`.

Transcript:
{transcript}

Return a JSON array of highlights with this exact format:
[
  {
    \"start_segment_id\": <first segment id of the highlight>,
    \"end_segment_id\": <last segment id of the highlight>,
    \"score\": <importance 0-100>,
    \"reason\": \"<why this moment stands out>\",
    \"category\": \"<important|funny|emotional|climax|quote|tutorial|other>\",
    \"suggested_title\": \"<short title>\"
  }
]

Requirements:
- Identify 3-10 highlights
- Focus on the most engaging moments
- Return ONLY valid JSON, no other text";

const CHAPTER_PROMPT: &str = "Analyze the following transcript and divide it into logical chapters.

Each transcript line is `<segment_id> [MM:SS] text`.

Transcript:
{transcript}

Return a JSON array of chapters with this exact format:
[
  {
    \"start_s\": <start time in seconds>,
    \"end_s\": <end time in seconds>,
    \"title\": \"<chapter title>\",
    \"summary\": \"<one-sentence summary>\"
  }
]

Requirements:
- Create 3-8 chapters that cover the entire video
- Chapters must be sequential and non-overlapping
- Return ONLY valid JSON, no other text";

const SUMMARY_PROMPT: &str = "Summarize the following transcript in 2-3 sentences.

Transcript:
{transcript}

Return only the summary, no other text.";

const TITLE_PROMPT: &str = "Suggest 5 compelling video titles for a video with this transcript.

Transcript:
{transcript}

Return a JSON array of title strings. Return ONLY valid JSON, no other text.";

/// Runs the analysis task kinds through the router and assembles an
/// [`AnalysisResult`]. Individual task failures degrade gracefully: the
/// result is still produced with that part empty or defaulted.
pub struct Analyzer {
    router: Arc<LlmRouter>,
}

impl Analyzer {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self { router }
    }

    pub async fn analyze(
        &self,
        transcription: &TranscriptionResult,
        cancel: &CancellationToken,
    ) -> crate::error::Result<AnalysisResult> {
        if transcription.is_empty() {
            info!("empty transcript, producing empty analysis");
            return Ok(AnalysisResult::default());
        }

        let transcript = prepare_transcript(transcription);

        let highlights = self.detect_highlights(&transcript, transcription, cancel).await;
        check_cancel(cancel)?;

        let chapters = self.detect_chapters(&transcript, transcription, cancel).await;
        check_cancel(cancel)?;

        let summary = self.generate_summary(&transcript, cancel).await;
        check_cancel(cancel)?;

        let title_candidates = self.generate_titles(&transcript, cancel).await;

        Ok(AnalysisResult {
            highlights,
            chapters,
            summary,
            title_candidates,
        })
    }

    async fn detect_highlights(
        &self,
        transcript: &str,
        transcription: &TranscriptionResult,
        cancel: &CancellationToken,
    ) -> Vec<Highlight> {
        let prompt = HIGHLIGHT_PROMPT.replace("{transcript}", transcript);
        match self
            .router
            .execute(
                TaskKind::HighlightDetection,
                &prompt,
                ResponseSchema::HighlightArray,
                cancel,
            )
            .await
        {
            Ok(value) => parse_highlights(&value, transcription),
            Err(e) => {
                warn!(error = %e, "highlight detection failed, continuing without highlights");
                Vec::new()
            }
        }
    }

    async fn detect_chapters(
        &self,
        transcript: &str,
        transcription: &TranscriptionResult,
        cancel: &CancellationToken,
    ) -> Vec<Chapter> {
        let prompt = CHAPTER_PROMPT.replace("{transcript}", transcript);
        match self
            .router
            .execute(
                TaskKind::ChapterDetection,
                &prompt,
                ResponseSchema::ChapterArray,
                cancel,
            )
            .await
        {
            Ok(value) => {
                let chapters = parse_chapters(&value, transcription);
                if chapters.is_empty() {
                    default_chapters(transcription)
                } else {
                    chapters
                }
            }
            Err(e) => {
                warn!(error = %e, "chapter detection failed, using default chapters");
                default_chapters(transcription)
            }
        }
    }

    async fn generate_summary(&self, transcript: &str, cancel: &CancellationToken) -> String {
        // Shorter budget for the summary prompt. Summaries have no routing
        // entry of their own and ride the chapter-detection route.
        let truncated = truncate(transcript, MAX_TRANSCRIPT_CHARS / 2);
        let prompt = SUMMARY_PROMPT.replace("{transcript}", &truncated);
        match self
            .router
            .execute(
                TaskKind::ChapterDetection,
                &prompt,
                ResponseSchema::FreeText,
                cancel,
            )
            .await
        {
            Ok(Value::String(text)) => text,
            Ok(_) => String::new(),
            Err(e) => {
                warn!(error = %e, "summary generation failed");
                String::new()
            }
        }
    }

    async fn generate_titles(&self, transcript: &str, cancel: &CancellationToken) -> Vec<String> {
        let prompt = TITLE_PROMPT.replace("{transcript}", transcript);
        match self
            .router
            .execute(
                TaskKind::TitleGeneration,
                &prompt,
                ResponseSchema::TitleArray,
                cancel,
            )
            .await
        {
            Ok(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "title generation failed");
                Vec::new()
            }
        }
    }
}

/// Render the transcript with segment ids and timestamps, truncated to the
/// prompt budget.
fn prepare_transcript(transcription: &TranscriptionResult) -> String {
    let mut lines = Vec::with_capacity(transcription.segments.len());
    for segment in &transcription.segments {
        lines.push(format!(
            "{} [{}] {}",
            segment.id,
            format_timestamp(segment.start_s),
            segment.text
        ));
    }
    truncate(&lines.join("\n"), MAX_TRANSCRIPT_CHARS)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}\n...(truncated)")
}

fn format_timestamp(seconds: f64) -> String {
    let minutes = (seconds / 60.0) as u64;
    let secs = (seconds % 60.0) as u64;
    format!("{minutes:02}:{secs:02}")
}

/// Convert validated highlight JSON into typed highlights, dropping entries
/// that reference unknown segments.
fn parse_highlights(value: &Value, transcription: &TranscriptionResult) -> Vec<Highlight> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    let known: std::collections::BTreeSet<u32> =
        transcription.segments.iter().map(|s| s.id).collect();

    let mut highlights = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let start = obj.get("start_segment_id").and_then(Value::as_u64);
        let end = obj.get("end_segment_id").and_then(Value::as_u64);
        let score = obj.get("score").and_then(Value::as_u64);
        let (Some(start), Some(end), Some(score)) = (start, end, score) else {
            continue;
        };
        let (start, end) = (start as u32, end as u32);
        if end < start || !known.contains(&start) || !known.contains(&end) {
            debug!(start, end, "dropping highlight referencing unknown segments");
            continue;
        }
        highlights.push(Highlight {
            start_segment_id: start,
            end_segment_id: end,
            score: score.min(100) as u8,
            reason: string_field(obj, "reason"),
            category: string_field(obj, "category"),
            suggested_title: string_field(obj, "suggested_title"),
        });
    }
    highlights
}

/// Convert validated chapter JSON into ordered, non-overlapping chapters
/// whose segment id sets partition the transcript.
fn parse_chapters(value: &Value, transcription: &TranscriptionResult) -> Vec<Chapter> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    let mut raw: Vec<(f64, String, String)> = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let Some(start) = obj.get("start_s").and_then(Value::as_f64) else {
            continue;
        };
        let title = string_field(obj, "title");
        let summary = string_field(obj, "summary");
        raw.push((start.max(0.0), title, summary));
    }
    if raw.is_empty() {
        return Vec::new();
    }
    raw.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    // The first chapter always opens at zero so every segment lands somewhere.
    raw[0].0 = 0.0;

    let total = transcription.duration_s;
    let mut chapters = Vec::with_capacity(raw.len());
    for (i, (start, title, summary)) in raw.iter().enumerate() {
        let end = raw.get(i + 1).map_or(total, |next| next.0);
        if end <= *start && i + 1 < raw.len() {
            continue;
        }
        chapters.push(Chapter {
            id: chapters.len() as u32,
            start_s: *start,
            end_s: end.max(*start),
            title: title.clone(),
            summary: summary.clone(),
            segment_ids: Vec::new(),
        });
    }
    assign_segments(&mut chapters, transcription);
    chapters.retain(|c| !c.segment_ids.is_empty());
    for (i, chapter) in chapters.iter_mut().enumerate() {
        chapter.id = i as u32;
    }
    chapters
}

/// Evenly split the video into intro / main / conclusion when the model
/// yields nothing usable.
fn default_chapters(transcription: &TranscriptionResult) -> Vec<Chapter> {
    let total = transcription.duration_s;
    let third = total / 3.0;
    let mut chapters = vec![
        Chapter {
            id: 0,
            start_s: 0.0,
            end_s: third,
            title: "Introduction".to_string(),
            summary: String::new(),
            segment_ids: Vec::new(),
        },
        Chapter {
            id: 1,
            start_s: third,
            end_s: third * 2.0,
            title: "Main Content".to_string(),
            summary: String::new(),
            segment_ids: Vec::new(),
        },
        Chapter {
            id: 2,
            start_s: third * 2.0,
            end_s: total,
            title: "Conclusion".to_string(),
            summary: String::new(),
            segment_ids: Vec::new(),
        },
    ];
    assign_segments(&mut chapters, transcription);
    chapters.retain(|c| !c.segment_ids.is_empty());
    for (i, chapter) in chapters.iter_mut().enumerate() {
        chapter.id = i as u32;
    }
    chapters
}

/// Assign each segment to exactly one chapter by its start time.
fn assign_segments(chapters: &mut [Chapter], transcription: &TranscriptionResult) {
    for segment in &transcription.segments {
        let mut target = chapters.len().saturating_sub(1);
        for (i, chapter) in chapters.iter().enumerate() {
            let is_last = i + 1 == chapters.len();
            if segment.start_s >= chapter.start_s
                && (segment.start_s < chapter.end_s || is_last)
            {
                target = i;
                break;
            }
        }
        if let Some(chapter) = chapters.get_mut(target) {
            chapter.segment_ids.push(segment.id);
        }
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn check_cancel(cancel: &CancellationToken) -> crate::error::Result<()> {
    if cancel.is_cancelled() {
        Err(crate::error::PipelineError::cancelled())
    } else {
        Ok(())
    }
}
