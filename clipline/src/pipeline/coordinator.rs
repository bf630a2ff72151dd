//! Pipeline coordination.
//!
//! The coordinator drives the fixed stage sequence, forwards artifacts
//! between stages, owns the per-stage retry budget, and persists
//! checkpoints at stage boundaries so a failed or cancelled run resumes at
//! item granularity.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clip_types::{Project, Segment, SubtitleFormat};
use clip_types::{ExportKind, ExportPlan, ExportPlanEntry, ExportResult};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::progress::{ProgressSink, ThrottledSink};
use super::stage::{StageContext, StageRunner, StageStatus};
use super::stages::{ArtifactStore, SelectionHandler, ARTIFACTS_FILE};
use super::timing::optimize_timing;
use crate::adapters::{Collaborators, SubtitleStyle};
use crate::analyze::Analyzer;
use crate::checkpoint::{new_run_id, Checkpoint, CheckpointStore, RunHandle, Stage};
use crate::config::AppConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::llm::{LlmError, LlmRouter};
use crate::monitor::{JobKind, ResourceGate, ResourceMonitor};
use crate::retry::Backoff;
use crate::temp::TempFileManager;
use crate::translate::{Chunk, PartialTranslationResult, Translator, FLAG_TRANSLATION_FAILED};

/// How long a stage waits for gate admission before giving up.
const GATE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of driving a run to a stopping point.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run finished; the checkpoint was cleaned up (by default).
    Completed(Box<Project>),
    /// The run is parked at the selection stage; the checkpoint holds.
    AwaitingSelection { run_id: String },
}

enum StageOutcome {
    Done,
    Parked,
}

/// Drives one run end-to-end through the stage sequence.
pub struct PipelineCoordinator {
    config: AppConfig,
    collaborators: Collaborators,
    router: Arc<LlmRouter>,
    store: CheckpointStore,
    monitor: ResourceMonitor,
    gate: ResourceGate,
    cancel: CancellationToken,
    selection: Option<Arc<dyn SelectionHandler>>,
    progress: Arc<dyn ProgressSink>,
    stage_retry: Backoff,
    /// Concurrent drives sharing this coordinator (batch export); the
    /// monitor runs while any of them is live.
    active_runs: std::sync::atomic::AtomicUsize,
}

impl PipelineCoordinator {
    pub fn new(
        config: AppConfig,
        collaborators: Collaborators,
        router: Arc<LlmRouter>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let monitor = ResourceMonitor::new();
        let gate = ResourceGate::new(monitor.clone(), config.resource.clone());
        let store = CheckpointStore::new(&config.state_root)
            .with_expiration_hours(config.checkpoint.expire_after_hours);
        let stage_retry = Backoff::with_attempts(config.stage.retry_budget);
        Self {
            config,
            collaborators,
            router,
            store,
            monitor,
            gate,
            cancel: CancellationToken::new(),
            selection: None,
            progress: Arc::new(ThrottledSink::new(progress)),
            stage_retry,
            active_runs: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Install the selection callback for the await-selection stage.
    pub fn with_selection_handler(mut self, handler: Arc<dyn SelectionHandler>) -> Self {
        self.selection = Some(handler);
        self
    }

    /// Request cancellation. Idempotent; the current item finishes or
    /// aborts at the next safe point, a checkpoint is written, and the run
    /// returns a cancellation error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn router_metrics(&self) -> crate::llm::RouterMetricsSnapshot {
        self.router.metrics()
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Execute a new run end-to-end.
    pub async fn run(&self, url: &str) -> Result<RunOutcome> {
        let run_id = new_run_id();
        info!(run_id = %run_id, url = %url, "starting run");

        let handle = Arc::new(self.store.open(&run_id).await?);
        let checkpoint = Checkpoint::new(&run_id, url, self.config.clone());
        handle.save(&checkpoint).await?;

        self.drive(handle, checkpoint, ArtifactStore::default())
            .await
    }

    /// Resume a run from its durable checkpoint.
    pub async fn run_from_checkpoint(&self, run_id: &str) -> Result<RunOutcome> {
        let handle = Arc::new(self.store.open(run_id).await?);
        let mut checkpoint = handle.load().await?.ok_or_else(|| {
            PipelineError::corrupt_state(format!("run {run_id} has no checkpoint"))
        })?;
        if self.store.is_expired(&checkpoint) {
            return Err(PipelineError::corrupt_state(format!(
                "checkpoint for run {run_id} has expired"
            )));
        }
        let artifacts: ArtifactStore = handle
            .load_document(ARTIFACTS_FILE)
            .await?
            .unwrap_or_default();

        match checkpoint.stage {
            Stage::Completed => {
                // Re-running a terminal checkpoint re-executes nothing.
                info!(run_id = %run_id, "checkpoint already completed");
                let project = self.build_project(&checkpoint, &artifacts)?;
                return Ok(RunOutcome::Completed(Box::new(project)));
            }
            Stage::Failed | Stage::Canceled => {
                let resume = checkpoint.resume_stage.ok_or_else(|| {
                    PipelineError::corrupt_state(format!(
                        "terminal checkpoint for run {run_id} has no resume stage"
                    ))
                })?;
                info!(run_id = %run_id, stage = %resume, "resuming failed run");
                // Completed items survive; the failed stage gets a fresh
                // retry budget.
                checkpoint.stage = resume;
                checkpoint.resume_stage = None;
                checkpoint.retry_count = 0;
            }
            stage => {
                info!(run_id = %run_id, stage = %stage, "resuming run");
            }
        }

        self.drive(handle, checkpoint, artifacts).await
    }

    async fn drive(
        &self,
        handle: Arc<RunHandle>,
        checkpoint: Checkpoint,
        artifacts: ArtifactStore,
    ) -> Result<RunOutcome> {
        use std::sync::atomic::Ordering;
        if self.active_runs.fetch_add(1, Ordering::SeqCst) == 0 {
            self.monitor.start();
        }
        let checkpoint = Arc::new(Mutex::new(checkpoint));
        let artifacts = Arc::new(Mutex::new(artifacts));

        let result = self.drive_stages(&handle, &checkpoint, &artifacts).await;
        if self.active_runs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.monitor.stop().await;
        }

        let temp = TempFileManager::new(
            handle.temp_dir(),
            self.config.checkpoint.retain_temp_on_failure,
        );

        match result {
            Ok(RunOutcome::Completed(project)) => {
                if self.config.checkpoint.cleanup_on_success {
                    handle.delete().await?;
                } else {
                    self.persist(&handle, &checkpoint, &artifacts).await;
                    temp.cleanup_on_success().await;
                }
                self.progress.report(1.0, "completed", "run complete");
                Ok(RunOutcome::Completed(project))
            }
            Ok(parked @ RunOutcome::AwaitingSelection { .. }) => {
                self.persist(&handle, &checkpoint, &artifacts).await;
                info!("run parked awaiting user selection");
                Ok(parked)
            }
            Err(e) if e.is_cancelled() => {
                // The checkpoint keeps the interrupted stage so a resume
                // picks up at the last completed item.
                self.persist(&handle, &checkpoint, &artifacts).await;
                warn!("run cancelled, checkpoint preserved");
                Err(e)
            }
            Err(e) => {
                {
                    let mut cp = checkpoint.lock().await;
                    cp.resume_stage = Some(cp.stage);
                    cp.stage = Stage::Failed;
                    cp.last_error = Some(e.user_message());
                    cp.updated_at = Utc::now();
                }
                self.persist(&handle, &checkpoint, &artifacts).await;
                temp.cleanup_on_failure().await;
                error!(error = %e, "run failed, checkpoint preserved for resume");
                Err(e)
            }
        }
    }

    /// Best-effort persistence of checkpoint and artifact snapshot.
    async fn persist(
        &self,
        handle: &RunHandle,
        checkpoint: &Mutex<Checkpoint>,
        artifacts: &Mutex<ArtifactStore>,
    ) {
        let snapshot = checkpoint.lock().await.clone();
        if let Err(e) = handle.save(&snapshot).await {
            error!(error = %e, "failed to persist checkpoint");
        }
        let arts = artifacts.lock().await.clone();
        if let Err(e) = handle.save_document(ARTIFACTS_FILE, &arts).await {
            error!(error = %e, "failed to persist artifacts");
        }
    }

    async fn drive_stages(
        &self,
        handle: &Arc<RunHandle>,
        checkpoint: &Arc<Mutex<Checkpoint>>,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<RunOutcome> {
        {
            let mut cp = checkpoint.lock().await;
            if cp.stage == Stage::Pending {
                cp.advance_to(Stage::Fetch);
            }
        }

        loop {
            let stage = checkpoint.lock().await.stage;
            if stage == Stage::Completed {
                let cp = checkpoint.lock().await.clone();
                let arts = artifacts.lock().await.clone();
                let project = self.build_project(&cp, &arts)?;
                return Ok(RunOutcome::Completed(Box::new(project)));
            }

            let ctx = StageContext {
                stage,
                handle: handle.clone(),
                checkpoint: checkpoint.clone(),
                cancel: self.cancel.clone(),
                progress: self.progress.clone(),
            };
            info!(stage = %stage, "entering stage");
            ctx.report(0.0, "starting").await;

            match self.run_stage_with_retries(&ctx, artifacts).await? {
                StageOutcome::Parked => {
                    return Ok(RunOutcome::AwaitingSelection {
                        run_id: handle.run_id().to_string(),
                    });
                }
                StageOutcome::Done => {}
            }

            ctx.report(1.0, "complete").await;

            // Stage boundary: artifacts first, then the cursor advance, so
            // a crash in between resumes into a stage whose inputs exist.
            {
                let arts = artifacts.lock().await.clone();
                handle.save_document(ARTIFACTS_FILE, &arts).await?;
            }
            let snapshot = {
                let mut cp = checkpoint.lock().await;
                let next = stage.next().unwrap_or(Stage::Completed);
                cp.advance_to(next);
                cp.clone()
            };
            handle.save(&snapshot).await?;
        }
    }

    async fn run_stage_with_retries(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<StageOutcome> {
        let stage_timeout = self.config.stage.stage_timeout_secs.map(Duration::from_secs);
        loop {
            ctx.check_cancel()?;

            let attempt = self.execute_stage(ctx, artifacts);
            let result = match stage_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::new(
                        ErrorKind::ResourceExhausted,
                        format!("stage {} exceeded its soft timeout", ctx.stage),
                    )
                    .retryable(true)
                    .with_stage(ctx.stage)),
                },
                None => attempt.await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    let retry_count = {
                        let mut cp = ctx.checkpoint.lock().await;
                        cp.record_error(e.user_message());
                        cp.retry_count
                    };
                    let snapshot = ctx.checkpoint.lock().await.clone();
                    if let Err(save_err) = ctx.handle.save(&snapshot).await {
                        error!(error = %save_err, "failed to persist retry state");
                    }

                    if self.stage_retry.should_retry(&e, retry_count - 1) {
                        let delay = self.stage_retry.delay(retry_count - 1);
                        warn!(
                            stage = %ctx.stage,
                            attempt = retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "stage failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                return Err(PipelineError::cancelled().with_stage(ctx.stage));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return Err(e.with_stage(ctx.stage));
                }
            }
        }
    }

    async fn execute_stage(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<StageOutcome> {
        match ctx.stage {
            Stage::Fetch => self.stage_fetch(ctx, artifacts).await.map(|_| StageOutcome::Done),
            Stage::ExtractAudio => self
                .stage_extract_audio(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::Transcribe => self
                .stage_transcribe(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::Analyze => self
                .stage_analyze(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::AwaitUserSelection => self.stage_selection(ctx, artifacts).await,
            Stage::Translate => self
                .stage_translate(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::GenerateSubtitles => self
                .stage_subtitles(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::EditVideo => self
                .stage_edit(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            Stage::Export => self
                .stage_export(ctx, artifacts)
                .await
                .map(|_| StageOutcome::Done),
            stage => Err(PipelineError::internal(format!(
                "stage {stage} is not executable"
            ))),
        }
    }

    /// Single-artifact stages re-run their one item when the artifact is
    /// missing, even if the checkpoint recorded it (crash between item
    /// completion and artifact persistence).
    async fn reset_single_item(&self, ctx: &StageContext, item_id: &str) {
        let mut cp = ctx.checkpoint.lock().await;
        cp.completed_items.remove(item_id);
    }

    async fn stage_fetch(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        if artifacts.lock().await.video.is_some() {
            return Ok(());
        }
        self.reset_single_item(ctx, "video").await;

        let url = ctx.checkpoint.lock().await.source_url.clone();
        let dir = self.temp(ctx).stage_dir("fetch").await?;
        let fetcher = self.collaborators.fetcher.clone();
        let quality = self.config.fetch.quality.clone();
        let gate = self.gate.clone();

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, vec![("video".to_string(), ())], |_, cancel| {
                let fetcher = fetcher.clone();
                let url = url.clone();
                let dir = dir.clone();
                let quality = quality.clone();
                let gate = gate.clone();
                async move {
                    let _ticket = gate
                        .acquire_with_timeout(JobKind::Export, GATE_ACQUIRE_TIMEOUT)
                        .await?;
                    fetcher.fetch(&url, &dir, &quality, &cancel).await.map_err(|e| {
                        let kind = e.error_kind();
                        PipelineError::new(kind, e.to_string()).with_source(e)
                    })
                }
            })
            .await?;

        let video = self.single_output(ctx, result)?;
        artifacts.lock().await.video = Some(video);
        Ok(())
    }

    async fn stage_extract_audio(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        if artifacts.lock().await.audio.is_some() {
            return Ok(());
        }
        self.reset_single_item(ctx, "audio").await;

        let video = artifacts.lock().await.video.clone().ok_or_else(|| {
            PipelineError::corrupt_state("extract_audio entered without a video artifact")
        })?;
        let dir = self.temp(ctx).stage_dir("audio").await?;
        let extractor = self.collaborators.audio.clone();
        let gate = self.gate.clone();

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, vec![("audio".to_string(), ())], |_, cancel| {
                let extractor = extractor.clone();
                let video_path = video.path.clone();
                let dir = dir.clone();
                let gate = gate.clone();
                async move {
                    let _ticket = gate
                        .acquire_with_timeout(JobKind::Encode, GATE_ACQUIRE_TIMEOUT)
                        .await?;
                    extractor.extract(&video_path, &dir, &cancel).await.map_err(|e| {
                        let kind = e.error_kind();
                        PipelineError::new(kind, e.to_string()).with_source(e)
                    })
                }
            })
            .await?;

        let audio = self.single_output(ctx, result)?;
        artifacts.lock().await.audio = Some(audio);
        Ok(())
    }

    async fn stage_transcribe(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        if artifacts.lock().await.transcription.is_some() {
            return Ok(());
        }
        self.reset_single_item(ctx, "transcript").await;

        let audio = artifacts.lock().await.audio.clone().ok_or_else(|| {
            PipelineError::corrupt_state("transcribe entered without an audio artifact")
        })?;
        let transcriber = self.collaborators.transcriber.clone();
        let gate = self.gate.clone();

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, vec![("transcript".to_string(), ())], |_, cancel| {
                let transcriber = transcriber.clone();
                let audio_path = audio.path.clone();
                let gate = gate.clone();
                async move {
                    let _ticket = gate
                        .acquire_with_timeout(JobKind::Export, GATE_ACQUIRE_TIMEOUT)
                        .await?;
                    transcriber
                        .transcribe(&audio_path, None, false, &cancel)
                        .await
                        .map_err(|e| {
                            let kind = e.error_kind();
                            PipelineError::new(kind, e.to_string()).with_source(e)
                        })
                }
            })
            .await?;

        let transcription = self.single_output(ctx, result)?;
        info!(
            segments = transcription.segments.len(),
            language = %transcription.language,
            "transcription complete"
        );
        artifacts.lock().await.transcription = Some(transcription);
        Ok(())
    }

    async fn stage_analyze(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        if artifacts.lock().await.analysis.is_some() {
            return Ok(());
        }
        self.reset_single_item(ctx, "analysis").await;

        let transcription = artifacts.lock().await.transcription.clone().ok_or_else(|| {
            PipelineError::corrupt_state("analyze entered without a transcription")
        })?;
        let analyzer = Analyzer::new(self.router.clone());

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, vec![("analysis".to_string(), ())], |_, cancel| {
                let analyzer = &analyzer;
                let transcription = transcription.clone();
                async move { analyzer.analyze(&transcription, &cancel).await }
            })
            .await?;

        let analysis = self.single_output(ctx, result)?;
        artifacts.lock().await.analysis = Some(analysis);
        Ok(())
    }

    async fn stage_selection(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<StageOutcome> {
        if artifacts.lock().await.selection.is_some() {
            return Ok(StageOutcome::Done);
        }

        let (analysis, transcription) = {
            let arts = artifacts.lock().await;
            let analysis = arts.analysis.clone().ok_or_else(|| {
                PipelineError::corrupt_state("selection entered without analysis")
            })?;
            let transcription = arts.transcription.clone().ok_or_else(|| {
                PipelineError::corrupt_state("selection entered without a transcription")
            })?;
            (analysis, transcription)
        };

        let Some(handler) = self.selection.clone() else {
            return Ok(StageOutcome::Parked);
        };

        let selected = {
            let select = handler.select(&analysis, &transcription);
            match self.config.stage.selection_timeout_secs {
                Some(secs) => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(PipelineError::cancelled().with_stage(ctx.stage));
                    }
                    result = tokio::time::timeout(Duration::from_secs(secs), select) => {
                        result.ok().flatten()
                    }
                },
                None => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(PipelineError::cancelled().with_stage(ctx.stage));
                    }
                    selection = select => selection,
                },
            }
        };

        match selected {
            Some(selection) => {
                for segment in &selection.edit_segments {
                    if !segment.is_well_formed() {
                        return Err(PipelineError::invalid_input(format!(
                            "edit segment {} has invalid bounds or speed",
                            segment.id
                        ))
                        .with_stage(ctx.stage));
                    }
                }
                info!(spans = selection.edit_segments.len(), "selection received");
                artifacts.lock().await.selection = Some(selection);
                Ok(StageOutcome::Done)
            }
            None => Ok(StageOutcome::Parked),
        }
    }

    async fn stage_translate(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        let transcription = artifacts.lock().await.transcription.clone().ok_or_else(|| {
            PipelineError::corrupt_state("translate entered without a transcription")
        })?;
        if transcription.segments.is_empty() {
            return Ok(());
        }

        let translator = Arc::new(Translator::new(
            self.router.clone(),
            self.config.translation.clone(),
            self.config.target_language.clone(),
        ));

        // The artifact snapshot decides what is still pending: a crash
        // between a checkpoint write and the artifact write re-translates
        // the affected segments instead of losing them.
        let translated_ids: BTreeSet<u32> =
            artifacts.lock().await.translations.keys().copied().collect();
        let pending: Vec<Segment> = transcription
            .segments
            .iter()
            .filter(|s| !translated_ids.contains(&s.id))
            .cloned()
            .collect();
        let total = transcription.segments.len();
        let mut done = total - pending.len();

        // Chunks run concurrently up to the rpm-derived cap; the router's
        // token bucket paces the actual request rate underneath.
        let concurrency = (self.config.llm.rpm as usize / 60).clamp(1, 8);
        let mut queue: VecDeque<Chunk> = translator.chunks(&pending).into();
        let mut in_flight: JoinSet<std::result::Result<Vec<_>, LlmError>> = JoinSet::new();

        while !queue.is_empty() || !in_flight.is_empty() {
            // Dropping the join set on an early return aborts the
            // remaining in-flight chunks; their partial output is
            // discarded, which is exactly the cancellation contract.
            ctx.check_cancel()?;

            while in_flight.len() < concurrency {
                let Some(chunk) = queue.pop_front() else { break };
                let translator = translator.clone();
                let language = transcription.language.clone();
                let cancel = ctx.cancel.clone();
                in_flight.spawn(async move {
                    translator
                        .translate_chunk_with_fallback(&chunk, &language, &cancel)
                        .await
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                continue;
            };
            let translated = match joined {
                Ok(Ok(translated)) => translated,
                Ok(Err(LlmError::Cancelled)) => {
                    return Err(PipelineError::cancelled().with_stage(ctx.stage));
                }
                Ok(Err(e)) => {
                    let kind = e.error_kind();
                    return Err(PipelineError::new(kind, e.to_string()).with_stage(ctx.stage));
                }
                Err(e) => {
                    return Err(PipelineError::internal(format!(
                        "translation worker panicked: {e}"
                    ))
                    .with_stage(ctx.stage));
                }
            };

            for t in translated {
                done += 1;
                artifacts.lock().await.translations.insert(t.id, t.clone());
                ctx.complete_item(&t.id.to_string(), done as f64 / total as f64)
                    .await?;
            }

            // Chunk boundary: keep the artifact snapshot close to the
            // checkpoint so a crash loses at most one chunk of work.
            let arts = artifacts.lock().await.clone();
            ctx.handle.save_document(ARTIFACTS_FILE, &arts).await?;
        }

        let result = {
            let arts = artifacts.lock().await;
            let (failed, succeeded): (Vec<_>, Vec<_>) = arts
                .translations
                .values()
                .cloned()
                .partition(|t| t.quality_flags.iter().any(|f| f == FLAG_TRANSLATION_FAILED));
            PartialTranslationResult::from_parts(succeeded, failed)
        };
        info!(
            succeeded = result.successful.len(),
            failed = result.failed.len(),
            success_rate = result.success_rate,
            "translation finished"
        );

        if result.success_rate < self.config.translation.min_success_rate {
            return Err(PipelineError::new(
                ErrorKind::PartialFailure,
                format!(
                    "translation success rate {:.2} below floor {:.2}",
                    result.success_rate, self.config.translation.min_success_rate
                ),
            )
            .retryable(false)
            .with_stage(ctx.stage));
        }
        Ok(())
    }

    async fn stage_subtitles(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        let mut cues = artifacts.lock().await.ordered_translations();
        if cues.is_empty() {
            return Ok(());
        }
        optimize_timing(&mut cues, &self.config.subtitles);

        let video_id = artifacts
            .lock()
            .await
            .video
            .as_ref()
            .map(|v| v.video_id.clone())
            .unwrap_or_else(|| "output".to_string());
        let dir = self.temp(ctx).stage_dir("subtitles").await?;
        let writer = self.collaborators.subtitles.clone();
        let style = SubtitleStyle::default();
        let cues = Arc::new(cues);

        let items: Vec<(String, SubtitleFormat)> = self
            .config
            .subtitles
            .formats
            .iter()
            .map(|f| (f.extension().to_string(), *f))
            .collect();

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, items, |format, _cancel| {
                let writer = writer.clone();
                let style = style.clone();
                let cues = cues.clone();
                let path = dir.join(format!("{video_id}.{}", format.extension()));
                async move {
                    writer.write(&cues, &style, format, &path).await.map_err(|e| {
                        let kind = e.error_kind();
                        PipelineError::new(kind, e.to_string()).with_source(e)
                    })
                }
            })
            .await?;

        if result.status == StageStatus::Failed {
            let (_, e) = result.failures.into_iter().next().ok_or_else(|| {
                PipelineError::internal("subtitle stage failed without a recorded error")
            })?;
            return Err(e);
        }
        let mut arts = artifacts.lock().await;
        for (_, artifact) in result.outputs {
            arts.subtitles.retain(|s| s.format != artifact.format);
            arts.subtitles.push(artifact);
        }
        Ok(())
    }

    async fn stage_edit(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        if !artifacts.lock().await.edited.is_empty() {
            return Ok(());
        }
        self.reset_single_item(ctx, "edit").await;

        let (video, selection, subtitle) = {
            let arts = artifacts.lock().await;
            let video = arts.video.clone().ok_or_else(|| {
                PipelineError::corrupt_state("edit entered without a video artifact")
            })?;
            let selection = arts.selection.clone().ok_or_else(|| {
                PipelineError::corrupt_state("edit entered without a selection")
            })?;
            // Prefer the styled format for burn-in.
            let subtitle = arts
                .subtitles
                .iter()
                .find(|s| s.format == SubtitleFormat::Ass)
                .or_else(|| arts.subtitles.first())
                .map(|s| s.path.clone());
            (video, selection, subtitle)
        };

        let dir = self.temp(ctx).stage_dir("edit").await?;
        let editor = self.collaborators.editor.clone();
        let gate = self.gate.clone();
        let target = dir.join(format!("{}_edited.mp4", video.video_id));

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, vec![("edit".to_string(), ())], |_, cancel| {
                let editor = editor.clone();
                let video_path = video.path.clone();
                let segments = selection.edit_segments.clone();
                let gate = gate.clone();
                let output = crate::adapters::EditOutput {
                    target: target.clone(),
                    subtitle: subtitle.clone(),
                };
                async move {
                    let _ticket = gate
                        .acquire_with_timeout(JobKind::Encode, GATE_ACQUIRE_TIMEOUT)
                        .await?;
                    editor
                        .edit(&video_path, &segments, &output, &cancel)
                        .await
                        .map_err(|e| {
                            let kind = e.error_kind();
                            PipelineError::new(kind, e.to_string()).with_source(e)
                        })
                }
            })
            .await?;

        let edited = self.single_output(ctx, result)?;
        artifacts.lock().await.edited.push(edited);
        Ok(())
    }

    async fn stage_export(
        &self,
        ctx: &StageContext,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        let (plan, sources) = self.build_export_plan(artifacts).await?;
        info!(
            entries = plan.entries.len(),
            estimated_bytes = plan.estimated_total_bytes(),
            "export plan built"
        );

        let items: Vec<(String, (std::path::PathBuf, ExportPlanEntry))> = plan
            .entries
            .iter()
            .cloned()
            .zip(sources)
            .map(|(entry, source)| {
                let id = entry
                    .target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "entry".to_string());
                (id, (source, entry))
            })
            .collect();

        let runner = StageRunner::new(&self.config.stage);
        let result = runner
            .run(ctx, items, |(source, entry), _cancel| async move {
                if let Some(parent) = entry.target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| crate::error::io_error("creating export dir", parent, e))?;
                }
                tokio::fs::copy(&source, &entry.target)
                    .await
                    .map_err(|e| crate::error::io_error("exporting file", &entry.target, e))?;
                Ok(entry)
            })
            .await?;

        if result.status == StageStatus::Failed {
            let (_, e) = result.failures.into_iter().next().ok_or_else(|| {
                PipelineError::internal("export stage failed without a recorded error")
            })?;
            return Err(e);
        }

        let mut arts = artifacts.lock().await;
        let mut export = ExportResult {
            elapsed_s: started.elapsed().as_secs_f64(),
            ..ExportResult::default()
        };
        for video in &arts.edited {
            let exported = plan
                .entries
                .iter()
                .find(|e| e.kind == ExportKind::Video && file_name_matches(&e.target, &video.path));
            let mut video = video.clone();
            if let Some(entry) = exported {
                video.path = entry.target.clone();
            }
            export.videos.push(video);
        }
        for subtitle in &arts.subtitles {
            let exported = plan.entries.iter().find(|e| {
                e.kind == ExportKind::Subtitle && file_name_matches(&e.target, &subtitle.path)
            });
            let mut subtitle = subtitle.clone();
            if let Some(entry) = exported {
                subtitle.path = entry.target.clone();
            }
            export.subtitles.push(subtitle);
        }
        arts.export = Some(export);
        Ok(())
    }

    /// Enumerate the derivative files to produce. Built once at export
    /// start; immutable thereafter.
    async fn build_export_plan(
        &self,
        artifacts: &Arc<Mutex<ArtifactStore>>,
    ) -> Result<(ExportPlan, Vec<std::path::PathBuf>)> {
        let arts = artifacts.lock().await;
        let mut entries = Vec::new();
        let mut sources = Vec::new();

        for video in &arts.edited {
            let name = video
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "edited.mp4".to_string());
            entries.push(ExportPlanEntry {
                kind: ExportKind::Video,
                target: self.config.output_dir.join(name),
                estimated_bytes: video.bytes,
            });
            sources.push(video.path.clone());
        }
        for subtitle in &arts.subtitles {
            let name = subtitle
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("subs.{}", subtitle.format.extension()));
            let estimated = tokio::fs::metadata(&subtitle.path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            entries.push(ExportPlanEntry {
                kind: ExportKind::Subtitle,
                target: self.config.output_dir.join(name),
                estimated_bytes: estimated,
            });
            sources.push(subtitle.path.clone());
        }

        Ok((ExportPlan { entries }, sources))
    }

    fn build_project(&self, checkpoint: &Checkpoint, artifacts: &ArtifactStore) -> Result<Project> {
        let video = artifacts
            .video
            .clone()
            .ok_or_else(|| PipelineError::corrupt_state("completed run lost its video artifact"))?;
        let transcription = artifacts.transcription.clone().ok_or_else(|| {
            PipelineError::corrupt_state("completed run lost its transcription")
        })?;
        let analysis = artifacts.analysis.clone().unwrap_or_default();
        let translations = artifacts.ordered_translations();
        let export = artifacts.export.clone().unwrap_or_default();

        Ok(Project {
            run_id: checkpoint.run_id.clone(),
            source_url: checkpoint.source_url.clone(),
            video,
            transcription,
            analysis,
            translation: (!translations.is_empty()).then_some(translations),
            subtitles: export.subtitles.clone(),
            exports: export,
        })
    }

    /// Unwrap a single-item stage result into its one output.
    fn single_output<O>(
        &self,
        ctx: &StageContext,
        result: super::stage::StageResult<O>,
    ) -> Result<O> {
        if let Some((_, e)) = result.failures.into_iter().next() {
            return Err(e);
        }
        result
            .outputs
            .into_iter()
            .next()
            .map(|(_, output)| output)
            .ok_or_else(|| {
                PipelineError::internal(format!(
                    "stage {} produced no output",
                    ctx.stage
                ))
            })
    }

    fn temp(&self, ctx: &StageContext) -> TempFileManager {
        TempFileManager::new(
            ctx.handle.temp_dir(),
            self.config.checkpoint.retain_temp_on_failure,
        )
    }
}

fn file_name_matches(a: &std::path::Path, b: &std::path::Path) -> bool {
    a.file_name().is_some() && a.file_name() == b.file_name()
}
