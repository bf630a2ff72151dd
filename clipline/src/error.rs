//! Application-wide error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::Stage;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error classification. Kinds drive the retry policy, not the other way
/// around: each kind has a default retryability that call sites may
/// override when they know better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network-level failure talking to a remote collaborator.
    TransientNetwork,
    /// Remote provider asked us to back off.
    RateLimited,
    /// Bad user input (URL, edit segment); retrying cannot help.
    InvalidInput,
    /// Gate timeout, disk full, OOM.
    ResourceExhausted,
    /// A configured provider is down.
    ProviderUnavailable,
    /// An LLM response could not be parsed or failed schema validation.
    ParseFailure,
    /// A stage finished with some items failed but above the success floor.
    PartialFailure,
    /// The run was cancelled by the user.
    Cancelled,
    /// Checkpoint state is unreadable or owned by another process.
    CorruptState,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    /// Default retryability for this kind.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::RateLimited
                | ErrorKind::ProviderUnavailable
                | ErrorKind::ParseFailure
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::TransientNetwork => "transient network",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::ParseFailure => "parse failure",
            ErrorKind::PartialFailure => "partial failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CorruptState => "corrupt state",
            ErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// The error surfaced from `run`/`run_from_checkpoint`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    /// Stage the error escalated from, when known.
    pub stage: Option<Stage>,
    pub message: String,
    pub retryable: bool,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
            retryable: kind.default_retryable(),
            source: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled")
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn corrupt_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptState, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// One-line message suitable for end users: kind, stage and cause.
    pub fn user_message(&self) -> String {
        match self.stage {
            Some(stage) => format!("{} ({} stage): {}", self.kind, stage, self.message),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::new(ErrorKind::Internal, format!("I/O error: {e}")).with_source(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::new(ErrorKind::CorruptState, format!("serialization error: {e}"))
            .with_source(e)
    }
}

/// Attach operation + path context to an I/O error.
pub fn io_error(op: &'static str, path: &std::path::Path, source: std::io::Error) -> PipelineError {
    PipelineError::new(
        ErrorKind::Internal,
        format!("{op} failed for {}: {source}", path.display()),
    )
    .with_source(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryability() {
        assert!(ErrorKind::TransientNetwork.default_retryable());
        assert!(ErrorKind::RateLimited.default_retryable());
        assert!(!ErrorKind::InvalidInput.default_retryable());
        assert!(!ErrorKind::Cancelled.default_retryable());
    }

    #[test]
    fn test_user_message_includes_stage() {
        let err = PipelineError::new(ErrorKind::TransientNetwork, "connection reset")
            .with_stage(Stage::Fetch);
        assert!(err.user_message().contains("fetch"));
        assert!(err.user_message().contains("connection reset"));
    }

    #[test]
    fn test_retryable_override() {
        let err = PipelineError::new(ErrorKind::TransientNetwork, "gone").retryable(false);
        assert!(!err.retryable);
    }
}
