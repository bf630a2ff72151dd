//! Generic stage execution.
//!
//! [`StageRunner`] wraps a stage's per-item work with the cross-cutting
//! obligations: skipping items the checkpoint already recorded, polling
//! cancellation between items, per-item timeouts, checkpoint writes after
//! every completed item, and success-floor accounting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::{overall_progress, ProgressSink};
use crate::checkpoint::{Checkpoint, RunHandle, Stage};
use crate::config::StageConfig;
use crate::error::{ErrorKind, PipelineError, Result};

/// Aggregate status of a stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Every item succeeded.
    Success,
    /// At least `min_success_rate` of items succeeded.
    Partial,
    /// Too many items failed.
    Failed,
}

/// Output of one stage execution.
#[derive(Debug)]
pub struct StageResult<O> {
    /// Item outputs in input order, for newly executed items only.
    pub outputs: Vec<(String, O)>,
    /// Items that failed, with their classified errors.
    pub failures: Vec<(String, PipelineError)>,
    /// Items skipped because the checkpoint already recorded them.
    pub skipped: usize,
    pub status: StageStatus,
}

/// Shared context handed to a stage execution.
#[derive(Clone)]
pub struct StageContext {
    pub stage: Stage,
    pub handle: Arc<RunHandle>,
    pub checkpoint: Arc<Mutex<Checkpoint>>,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
}

impl StageContext {
    /// Report stage progress through the sink and remember it in the
    /// in-memory checkpoint.
    pub async fn report(&self, stage_progress: f64, detail: &str) {
        {
            let mut checkpoint = self.checkpoint.lock().await;
            checkpoint.stage_progress = stage_progress;
        }
        self.progress.report(
            overall_progress(self.stage, stage_progress),
            &self.stage.to_string(),
            detail,
        );
    }

    /// Record one completed item and persist the checkpoint.
    pub async fn complete_item(&self, item_id: &str, stage_progress: f64) -> Result<()> {
        let snapshot = {
            let mut checkpoint = self.checkpoint.lock().await;
            checkpoint.complete_item(item_id);
            checkpoint.stage_progress = stage_progress;
            checkpoint.clone()
        };
        self.handle.save(&snapshot).await
    }

    pub async fn is_item_completed(&self, item_id: &str) -> bool {
        self.checkpoint.lock().await.is_item_completed(item_id)
    }

    pub fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::cancelled().with_stage(self.stage))
        } else {
            Ok(())
        }
    }
}

/// Runs a stage's items through a worker function.
pub struct StageRunner {
    min_success_rate: f64,
    item_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(config: &StageConfig) -> Self {
        Self {
            min_success_rate: config.min_success_rate,
            item_timeout: config.item_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Execute `worker` for every item not already in `completed_items`.
    ///
    /// Items run sequentially; stage-local parallelism (translation chunks,
    /// export entries) is layered by the callers that need it.
    pub async fn run<I, O, F, Fut>(
        &self,
        ctx: &StageContext,
        items: Vec<(String, I)>,
        worker: F,
    ) -> Result<StageResult<O>>
    where
        F: Fn(I, CancellationToken) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        let total = items.len().max(1);
        let mut outputs = Vec::new();
        let mut failures: Vec<(String, PipelineError)> = Vec::new();
        let mut skipped = 0usize;
        let mut done = 0usize;

        for (item_id, item) in items {
            ctx.check_cancel()?;

            if ctx.is_item_completed(&item_id).await {
                debug!(stage = %ctx.stage, item = %item_id, "skipping completed item");
                skipped += 1;
                done += 1;
                continue;
            }

            {
                let mut checkpoint = ctx.checkpoint.lock().await;
                checkpoint.current_item = Some(item_id.clone());
                checkpoint.current_item_progress = 0.0;
            }
            ctx.report(done as f64 / total as f64, &item_id).await;

            let work = worker(item, ctx.cancel.child_token());
            let result = match self.item_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::new(
                        ErrorKind::ResourceExhausted,
                        format!("item {item_id} timed out after {timeout:?}"),
                    )
                    .retryable(true)),
                },
                None => work.await,
            };

            match result {
                Ok(output) => {
                    done += 1;
                    ctx.complete_item(&item_id, done as f64 / total as f64)
                        .await?;
                    outputs.push((item_id, output));
                }
                Err(e) if e.is_cancelled() => {
                    // The in-flight item's partial output is discarded; the
                    // checkpoint already reflects the last finished item.
                    return Err(e.with_stage(ctx.stage));
                }
                Err(e) => {
                    warn!(stage = %ctx.stage, item = %item_id, error = %e, "item failed");
                    done += 1;
                    failures.push((item_id, e.with_stage(ctx.stage)));
                }
            }
        }

        let succeeded = outputs.len() + skipped;
        let status = if failures.is_empty() {
            StageStatus::Success
        } else if (succeeded as f64 / total as f64) >= self.min_success_rate {
            StageStatus::Partial
        } else {
            StageStatus::Failed
        };

        Ok(StageResult {
            outputs,
            failures,
            skipped,
            status,
        })
    }
}
