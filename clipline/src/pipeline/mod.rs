//! Staged pipeline engine.

pub mod coordinator;
pub mod progress;
pub mod stage;
pub mod stages;
pub mod timing;

pub use coordinator::{PipelineCoordinator, RunOutcome};
pub use progress::{NoopSink, ProgressSink, ThrottledSink};
pub use stage::{StageContext, StageResult, StageRunner, StageStatus};
pub use stages::{ArtifactStore, AutoSelection, SelectionHandler};
pub use timing::optimize_timing;
