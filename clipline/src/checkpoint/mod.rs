//! Durable per-run checkpoint state.
//!
//! A checkpoint records where a run stands: the stage cursor, the set of
//! items already completed inside that stage, and enough context to resume
//! after a crash or cancellation. One checkpoint file exists per run under
//! `<state_root>/<run_id>/checkpoint.json`.

mod store;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

pub use store::{CheckpointStore, RunHandle};

/// Fixed pipeline stages, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Fetch,
    ExtractAudio,
    Transcribe,
    Analyze,
    AwaitUserSelection,
    Translate,
    GenerateSubtitles,
    EditVideo,
    Export,
    Completed,
    Failed,
    Canceled,
}

impl Stage {
    /// Position of the stage on the cursor axis. Terminal stages compare
    /// greater than every runnable stage.
    pub fn index(&self) -> u8 {
        match self {
            Stage::Pending => 0,
            Stage::Fetch => 1,
            Stage::ExtractAudio => 2,
            Stage::Transcribe => 3,
            Stage::Analyze => 4,
            Stage::AwaitUserSelection => 5,
            Stage::Translate => 6,
            Stage::GenerateSubtitles => 7,
            Stage::EditVideo => 8,
            Stage::Export => 9,
            Stage::Completed => 10,
            Stage::Failed => 10,
            Stage::Canceled => 10,
        }
    }

    /// The run is over, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Canceled)
    }

    /// The runnable stage following this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::Fetch),
            Stage::Fetch => Some(Stage::ExtractAudio),
            Stage::ExtractAudio => Some(Stage::Transcribe),
            Stage::Transcribe => Some(Stage::Analyze),
            Stage::Analyze => Some(Stage::AwaitUserSelection),
            Stage::AwaitUserSelection => Some(Stage::Translate),
            Stage::Translate => Some(Stage::GenerateSubtitles),
            Stage::GenerateSubtitles => Some(Stage::EditVideo),
            Stage::EditVideo => Some(Stage::Export),
            Stage::Export => Some(Stage::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Pending => "pending",
            Stage::Fetch => "fetch",
            Stage::ExtractAudio => "extract_audio",
            Stage::Transcribe => "transcribe",
            Stage::Analyze => "analyze",
            Stage::AwaitUserSelection => "await_user_selection",
            Stage::Translate => "translate",
            Stage::GenerateSubtitles => "generate_subtitles",
            Stage::EditVideo => "edit_video",
            Stage::Export => "export",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// Generate a fresh opaque run identifier.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Durable run state. Serialized sets are sorted string arrays and
/// timestamps are ISO-8601 UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub stage: Stage,
    /// The stage a failed run should re-enter on resume. Only set while
    /// `stage` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_stage: Option<Stage>,
    /// Progress of the current stage in `[0, 1]`.
    #[serde(default)]
    pub stage_progress: f64,
    /// Item ids already completed within the current stage.
    #[serde(default)]
    pub completed_items: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    #[serde(default)]
    pub current_item_progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retries consumed by the current stage.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config_snapshot: AppConfig,
    pub source_url: String,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, source_url: impl Into<String>, config: AppConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            stage: Stage::Pending,
            resume_stage: None,
            stage_progress: 0.0,
            completed_items: BTreeSet::new(),
            current_item: None,
            current_item_progress: 0.0,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            config_snapshot: config,
            source_url: source_url.into(),
        }
    }

    /// Move the stage cursor forward, resetting per-stage bookkeeping.
    pub fn advance_to(&mut self, stage: Stage) {
        self.stage = stage;
        self.resume_stage = None;
        self.stage_progress = 0.0;
        self.completed_items.clear();
        self.current_item = None;
        self.current_item_progress = 0.0;
        self.retry_count = 0;
        self.touch();
    }

    /// Record a completed item within the current stage.
    pub fn complete_item(&mut self, item_id: impl Into<String>) {
        let item_id = item_id.into();
        if self.current_item.as_deref() == Some(item_id.as_str()) {
            self.current_item = None;
            self.current_item_progress = 0.0;
        }
        self.completed_items.insert(item_id);
        self.touch();
    }

    pub fn is_item_completed(&self, item_id: &str) -> bool {
        self.completed_items.contains(item_id)
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.retry_count += 1;
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
