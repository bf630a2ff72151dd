//! # Clip Types
//!
//! Shared artifact types flowing between stages of the clipline pipeline.
//!
//! Artifacts are flat records related by integer id. Keeping relationships
//! id-based (rather than by reference) keeps the checkpoint serialization
//! trivial and cycle-free.

pub mod analysis;
pub mod artifact;
pub mod edit;
pub mod project;
pub mod segment;

pub use analysis::{AnalysisResult, Chapter, Highlight};
pub use artifact::{
    AudioArtifact, EditedVideo, ExportKind, ExportPlan, ExportPlanEntry, ExportResult, Resolution,
    SubtitleArtifact, SubtitleFormat, VideoArtifact,
};
pub use edit::{EditSegment, Selection, Transition};
pub use project::Project;
pub use segment::{Segment, TranscriptionResult, TranslatedSegment, WordTiming};
