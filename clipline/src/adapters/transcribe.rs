//! External-command transcriber.
//!
//! Runs a speech-to-text tool (whisper-style CLI) that prints a JSON
//! transcript on stdout. Model internals stay entirely on the other side of
//! the subprocess boundary.

use std::path::Path;

use async_trait::async_trait;
use clip_types::{Segment, TranscriptionResult, WordTiming};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::run_with_cancel;
use super::{TranscribeError, Transcriber};

/// Wraps an external transcription command.
pub struct CommandTranscriber {
    binary: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct RawTranscript {
    segments: Vec<RawSegment>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    words: Vec<RawWord>,
    #[serde(default)]
    speaker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    confidence: Option<f32>,
}

impl CommandTranscriber {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            binary: std::env::var("TRANSCRIBER_PATH")
                .unwrap_or_else(|_| "whisperx".to_string()),
            model: model.into(),
        }
    }

    fn classify_failure(stderr: &str) -> TranscribeError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("out of memory") || lowered.contains("oom") {
            TranscribeError::OutOfMemory
        } else if lowered.contains("model") && lowered.contains("load") {
            TranscribeError::ModelLoad(last_line(stderr))
        } else if lowered.contains("language") {
            TranscribeError::LanguageDetect(last_line(stderr))
        } else {
            TranscribeError::DeviceError(last_line(stderr))
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
        diarize: bool,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, TranscribeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg(audio)
            .args(["--model", &self.model])
            .args(["--output_format", "json"]);
        if let Some(language) = language {
            command.args(["--language", language]);
        }
        if diarize {
            command.arg("--diarize");
        }

        info!(audio = %audio.display(), model = %self.model, "transcribing");
        let output = run_with_cancel(command, cancel)
            .await
            .map_err(|e| TranscribeError::ModelLoad(format!("spawning {}: {e}", self.binary)))?
            .ok_or(TranscribeError::Cancelled)?;

        if !output.success() {
            return Err(Self::classify_failure(&output.stderr));
        }

        let raw: RawTranscript = serde_json::from_str(output.stdout.trim())
            .map_err(|e| TranscribeError::DeviceError(format!("unparseable transcript: {e}")))?;

        if raw.segments.is_empty() && raw.duration == 0.0 {
            return Err(TranscribeError::EmptyAudio);
        }

        debug!(segments = raw.segments.len(), language = %raw.language, "transcript parsed");
        Ok(convert(raw))
    }
}

/// Normalize the raw transcript: 1-based sequential ids ordered by start
/// time, with word timings carried through.
fn convert(raw: RawTranscript) -> TranscriptionResult {
    let mut raw_segments = raw.segments;
    raw_segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    let duration = if raw.duration > 0.0 {
        raw.duration
    } else {
        raw_segments.last().map(|s| s.end).unwrap_or(0.0)
    };

    let segments = raw_segments
        .into_iter()
        .enumerate()
        .map(|(i, s)| Segment {
            id: i as u32 + 1,
            start_s: s.start,
            end_s: s.end.max(s.start),
            text: s.text.trim().to_string(),
            confidence: s.confidence.unwrap_or(1.0),
            words: s
                .words
                .into_iter()
                .map(|w| WordTiming {
                    word: w.word,
                    start_s: w.start,
                    end_s: w.end,
                    confidence: w.confidence.unwrap_or(1.0),
                })
                .collect(),
            speaker: s.speaker,
        })
        .collect();

    TranscriptionResult {
        segments,
        language: raw.language,
        duration_s: duration,
    }
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_assigns_sequential_ids() {
        let raw = RawTranscript {
            segments: vec![
                RawSegment {
                    start: 10.0,
                    end: 20.0,
                    text: " world ".into(),
                    confidence: None,
                    words: Vec::new(),
                    speaker: None,
                },
                RawSegment {
                    start: 0.0,
                    end: 10.0,
                    text: "hello".into(),
                    confidence: Some(0.8),
                    words: Vec::new(),
                    speaker: Some("spk0".into()),
                },
            ],
            language: "en".into(),
            duration: 0.0,
        };
        let result = convert(raw);
        assert_eq!(result.segments[0].id, 1);
        assert_eq!(result.segments[0].text, "hello");
        assert_eq!(result.segments[1].id, 2);
        assert_eq!(result.segments[1].text, "world");
        assert_eq!(result.duration_s, 20.0);
    }

    #[test]
    fn test_classify_oom() {
        let err = CommandTranscriber::classify_failure("CUDA error: out of memory");
        assert!(matches!(err, TranscribeError::OutOfMemory));
    }

    #[test]
    fn test_classify_model_load() {
        let err = CommandTranscriber::classify_failure("failed to load model large-v3");
        assert!(matches!(err, TranscribeError::ModelLoad(_)));
    }
}
