//! Application configuration.
//!
//! Every component's knobs live in a closed record with explicit defaults.
//! Unknown keys are rejected at load time (`deny_unknown_fields`), so a
//! typo in a config file fails loudly instead of being silently ignored.

use std::path::{Path, PathBuf};

use clip_types::SubtitleFormat;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError, Result};
use crate::llm::TaskKind;

/// Which backend executes an LLM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => f.write_str("local"),
            ProviderKind::Remote => f.write_str("remote"),
        }
    }
}

/// Per-task provider routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingTable {
    #[serde(default = "default_local")]
    pub highlight_detection: ProviderKind,
    #[serde(default = "default_local")]
    pub chapter_detection: ProviderKind,
    #[serde(default = "default_local")]
    pub translation: ProviderKind,
    #[serde(default = "default_remote")]
    pub title_generation: ProviderKind,
}

fn default_local() -> ProviderKind {
    ProviderKind::Local
}

fn default_remote() -> ProviderKind {
    ProviderKind::Remote
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            highlight_detection: ProviderKind::Local,
            chapter_detection: ProviderKind::Local,
            translation: ProviderKind::Local,
            title_generation: ProviderKind::Remote,
        }
    }
}

impl RoutingTable {
    pub fn provider_for(&self, task: TaskKind) -> ProviderKind {
        match task {
            TaskKind::HighlightDetection => self.highlight_detection,
            TaskKind::ChapterDetection => self.chapter_detection,
            TaskKind::Translation => self.translation,
            TaskKind::TitleGeneration => self.title_generation,
        }
    }
}

/// Local (Ollama-style) provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_model")]
    pub model: String,
    #[serde(default = "default_local_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_local_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_local_model() -> String {
    "qwen3:8b".to_string()
}

fn default_local_timeout_secs() -> u64 {
    120
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_local_host(),
            model: default_local_model(),
            timeout_secs: default_local_timeout_secs(),
        }
    }
}

/// Remote provider settings. The API key is read from the named
/// environment variable, never stored in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry budget for rate-limited calls.
    #[serde(default = "default_remote_retries")]
    pub max_retries: u32,
}

fn default_remote_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_remote_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "CLIPLINE_API_KEY".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    60
}

fn default_remote_retries() -> u32 {
    3
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_remote_endpoint(),
            model: default_remote_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_remote_timeout_secs(),
            max_retries: default_remote_retries(),
        }
    }
}

/// LLM routing, sampling and rate-limit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub routing: RoutingTable,
    /// Retry a failed local call once on the remote provider.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Requests-per-minute budget for the remote provider.
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub local: LocalProviderConfig,
    #[serde(default)]
    pub remote: RemoteProviderConfig,
}

fn default_rpm() -> u32 {
    60
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    2048
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            routing: RoutingTable::default(),
            fallback_enabled: true,
            rpm: default_rpm(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            local: LocalProviderConfig::default(),
            remote: RemoteProviderConfig::default(),
        }
    }
}

/// Resource admission thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(default = "default_max_cpu")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_memory")]
    pub max_memory_percent: f32,
    #[serde(default = "default_max_gpu")]
    pub max_gpu_percent: f32,
    #[serde(default = "default_parallel_exports")]
    pub max_parallel_exports: usize,
    #[serde(default = "default_parallel_encodes")]
    pub max_parallel_encodes: usize,
}

fn default_max_cpu() -> f32 {
    80.0
}

fn default_max_memory() -> f32 {
    70.0
}

fn default_max_gpu() -> f32 {
    90.0
}

fn default_parallel_exports() -> usize {
    2
}

fn default_parallel_encodes() -> usize {
    1
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu(),
            max_memory_percent: default_max_memory(),
            max_gpu_percent: default_max_gpu(),
            max_parallel_exports: default_parallel_exports(),
            max_parallel_encodes: default_parallel_encodes(),
        }
    }
}

/// Translation batching and quality thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationConfig {
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_overlap_segments")]
    pub overlap_segments: usize,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Segments whose post-validation confidence drops below this are
    /// flagged but still included.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_min_length_ratio")]
    pub min_length_ratio: f64,
    #[serde(default = "default_max_length_ratio")]
    pub max_length_ratio: f64,
}

fn default_max_tokens_per_request() -> usize {
    4000
}

fn default_overlap_segments() -> usize {
    2
}

fn default_min_success_rate() -> f64 {
    0.90
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_min_length_ratio() -> f64 {
    0.3
}

fn default_max_length_ratio() -> f64 {
    2.0
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: default_max_tokens_per_request(),
            overlap_segments: default_overlap_segments(),
            min_success_rate: default_min_success_rate(),
            confidence_threshold: default_confidence_threshold(),
            min_length_ratio: default_min_length_ratio(),
            max_length_ratio: default_max_length_ratio(),
        }
    }
}

/// Stage execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Soft timeout for a whole stage; `None` means unbounded.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Timeout for a single item; `None` means unbounded.
    #[serde(default)]
    pub item_timeout_secs: Option<u64>,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// How long to wait for the user's selection; `None` blocks forever.
    #[serde(default)]
    pub selection_timeout_secs: Option<u64>,
}

fn default_retry_budget() -> u32 {
    3
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            stage_timeout_secs: None,
            item_timeout_secs: None,
            min_success_rate: default_min_success_rate(),
            selection_timeout_secs: None,
        }
    }
}

/// Checkpoint store policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub cleanup_on_success: bool,
    /// Store-wide expiration; `None` disables expiration.
    #[serde(default)]
    pub expire_after_hours: Option<u64>,
    #[serde(default = "default_true")]
    pub retain_temp_on_failure: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            cleanup_on_success: true,
            expire_after_hours: None,
            retain_temp_on_failure: true,
        }
    }
}

/// Subtitle output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtitleConfig {
    #[serde(default = "default_subtitle_formats")]
    pub formats: Vec<SubtitleFormat>,
    #[serde(default = "default_min_display_s")]
    pub min_display_s: f64,
    #[serde(default = "default_min_gap_s")]
    pub min_gap_s: f64,
}

fn default_subtitle_formats() -> Vec<SubtitleFormat> {
    vec![SubtitleFormat::Srt]
}

fn default_min_display_s() -> f64 {
    1.0
}

fn default_min_gap_s() -> f64 {
    0.1
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            formats: default_subtitle_formats(),
            min_display_s: default_min_display_s(),
            min_gap_s: default_min_gap_s(),
        }
    }
}

/// Batch export policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub retry_failed: bool,
    #[serde(default = "default_export_retries")]
    pub max_retries: u32,
}

fn default_export_retries() -> u32 {
    2
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            retry_failed: true,
            max_retries: default_export_retries(),
        }
    }
}

/// Fetch settings passed to the fetcher collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_quality() -> String {
    "1080p".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Root configuration record. A snapshot is embedded in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub state_root: PathBuf,
    pub output_dir: PathBuf,
    pub target_language: String,
    pub fetch: FetchConfig,
    pub llm: LlmConfig,
    pub resource: ResourceConfig,
    pub translation: TranslationConfig,
    pub stage: StageConfig,
    pub checkpoint: CheckpointConfig,
    pub subtitles: SubtitleConfig,
    pub export: ExportConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(".clipline"),
            output_dir: PathBuf::from("output"),
            target_language: "ja".to_string(),
            fetch: FetchConfig::default(),
            llm: LlmConfig::default(),
            resource: ResourceConfig::default(),
            translation: TranslationConfig::default(),
            stage: StageConfig::default(),
            checkpoint: CheckpointConfig::default(),
            subtitles: SubtitleConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file, rejecting unknown keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::error::io_error("reading config", path, e))?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::new(
                ErrorKind::InvalidInput,
                format!("invalid config {}: {e}", path.display()),
            )
        })
    }

    /// Load the file when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_admission_thresholds() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.resource.max_cpu_percent, 80.0);
        assert_eq!(cfg.resource.max_memory_percent, 70.0);
        assert_eq!(cfg.resource.max_gpu_percent, 90.0);
        assert_eq!(cfg.resource.max_parallel_exports, 2);
        assert_eq!(cfg.resource.max_parallel_encodes, 1);
    }

    #[test]
    fn test_routing_defaults() {
        let routing = RoutingTable::default();
        assert_eq!(routing.provider_for(TaskKind::Translation), ProviderKind::Local);
        assert_eq!(
            routing.provider_for(TaskKind::TitleGeneration),
            ProviderKind::Remote
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"{"state_root": "/tmp/x", "no_such_key": 1}"#;
        let parsed: std::result::Result<AppConfig, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{"target_language": "en", "llm": {"rpm": 30}}"#;
        let cfg: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.target_language, "en");
        assert_eq!(cfg.llm.rpm, 30);
        assert_eq!(cfg.translation.max_tokens_per_request, 4000);
    }

    #[test]
    fn test_config_snapshot_roundtrip() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }
}
