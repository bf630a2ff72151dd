//! LLM task routing.
//!
//! Analysis and translation run their prompts through [`LlmRouter`], which
//! picks a provider per task kind, enforces the remote rate budget, retries
//! with backoff, and parses responses into validated JSON.

mod local;
mod parser;
mod provider;
mod rate_limit;
mod remote;
mod router;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

pub use local::OllamaProvider;
pub use parser::{parse_structured, validate, ResponseSchema};
pub use provider::{Completion, GenerateOptions, LlmProvider};
pub use rate_limit::RequestRateLimiter;
pub use remote::RemoteProvider;
pub use router::{LlmRouter, RouterMetricsSnapshot};

/// The kinds of LLM work the pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    HighlightDetection,
    ChapterDetection,
    Translation,
    TitleGeneration,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskKind::HighlightDetection => "highlight_detection",
            TaskKind::ChapterDetection => "chapter_detection",
            TaskKind::Translation => "translation",
            TaskKind::TitleGeneration => "title_generation",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by providers and the router.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{provider} request timed out")]
    Timeout { provider: String },

    #[error("rate limited by remote provider")]
    RateLimited {
        /// Server-suggested wait, when the response carried one.
        retry_after: Option<Duration>,
    },

    #[error("remote provider quota exhausted")]
    QuotaExceeded,

    #[error("authentication failed for {provider}")]
    Auth { provider: String },

    #[error("{provider} unreachable: {reason}")]
    Unreachable { provider: String, reason: String },

    #[error("{provider} returned HTTP {status}")]
    Http { provider: String, status: u16 },

    #[error("malformed provider response: {reason}")]
    BadResponse { reason: String },

    #[error("response could not be parsed as structured data: {reason}")]
    ParseFailure { reason: String },

    #[error("response violated the {schema} schema: {reason}")]
    SchemaFailure { schema: &'static str, reason: String },

    #[error("call cancelled")]
    Cancelled,

    #[error("no {0} provider configured")]
    NoProvider(&'static str),
}

impl LlmError {
    /// Map to the pipeline error taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            LlmError::Timeout { .. } | LlmError::Http { .. } | LlmError::BadResponse { .. } => {
                ErrorKind::TransientNetwork
            }
            LlmError::RateLimited { .. } => ErrorKind::RateLimited,
            LlmError::QuotaExceeded => ErrorKind::ResourceExhausted,
            LlmError::Auth { .. } => ErrorKind::InvalidInput,
            LlmError::Unreachable { .. } | LlmError::NoProvider(_) => {
                ErrorKind::ProviderUnavailable
            }
            LlmError::ParseFailure { .. } | LlmError::SchemaFailure { .. } => {
                ErrorKind::ParseFailure
            }
            LlmError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a fallback to the remote provider may help.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout { .. }
                | LlmError::Unreachable { .. }
                | LlmError::Http { .. }
                | LlmError::BadResponse { .. }
                | LlmError::ParseFailure { .. }
                | LlmError::SchemaFailure { .. }
                | LlmError::NoProvider(_)
        )
    }
}
