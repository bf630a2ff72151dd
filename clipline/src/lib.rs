//! # clipline
//!
//! Pipeline orchestration core for producing trimmed, subtitled video
//! artifacts from a remote video URL. The coordinator drives the staged
//! dataflow (fetch, audio extraction, transcription, analysis, selection,
//! translation, subtitles, editing, export), routes LLM work between local
//! and remote providers, gates heavyweight jobs on live resource samples,
//! and persists checkpoints so a failed run resumes at item granularity.

pub mod adapters;
pub mod analyze;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod llm;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod retry;
pub mod temp;
pub mod translate;

pub use config::AppConfig;
pub use error::{ErrorKind, PipelineError, Result};
pub use pipeline::{PipelineCoordinator, RunOutcome};
