//! Batch export scheduling.
//!
//! Processes a queue of export requests on top of single-run execution,
//! honoring the gate's admission policy and the configured parallelism
//! cap. One failure never cancels its siblings (by default); failed
//! requests are re-enqueued up to the retry limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ExportConfig;
use crate::error::{PipelineError, Result};
use crate::monitor::{JobKind, ResourceGate};
use crate::pipeline::{PipelineCoordinator, ProgressSink, RunOutcome};

/// How long a queued request waits for gate admission.
const GATE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3600);

/// One queued unit of batch work.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub id: String,
    pub url: String,
}

/// Nested per-item progress reporting: the batch owns the outer completion
/// count, each item refines its own slice.
#[derive(Clone)]
pub struct ItemProgress {
    sink: Arc<dyn ProgressSink>,
    id: String,
    completed_before: usize,
    total: usize,
}

impl ItemProgress {
    pub fn report(&self, item_fraction: f64) {
        let overall =
            (self.completed_before as f64 + item_fraction.clamp(0.0, 1.0)) / self.total as f64;
        self.sink.report(overall, "batch_export", &self.id);
    }
}

/// Executes one request. The production executor drives a pipeline run;
/// tests swap in fakes.
#[async_trait]
pub trait ExportExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ExportRequest,
        progress: ItemProgress,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Runs each request as a full pipeline run on the shared coordinator.
pub struct PipelineExportExecutor {
    coordinator: Arc<PipelineCoordinator>,
}

impl PipelineExportExecutor {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ExportExecutor for PipelineExportExecutor {
    async fn execute(
        &self,
        request: &ExportRequest,
        progress: ItemProgress,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        progress.report(0.0);
        match self.coordinator.run(&request.url).await? {
            RunOutcome::Completed(_) => {
                progress.report(1.0);
                Ok(())
            }
            RunOutcome::AwaitingSelection { run_id } => Err(PipelineError::invalid_input(
                format!("batch run {run_id} parked awaiting selection"),
            )),
        }
    }
}

/// Aggregate outcome of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub successful: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

/// Schedules export requests with bounded concurrency.
pub struct BatchExporter {
    gate: ResourceGate,
    config: ExportConfig,
    parallel_exports: usize,
}

impl BatchExporter {
    pub fn new(gate: ResourceGate, config: ExportConfig, parallel_exports: usize) -> Self {
        Self {
            gate,
            config,
            parallel_exports: parallel_exports.max(1),
        }
    }

    /// Process all requests. Always returns a report covering every
    /// request: `successful + failed == requests`.
    pub async fn export_batch(
        &self,
        requests: Vec<ExportRequest>,
        executor: Arc<dyn ExportExecutor>,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let total = requests.len();
        let mut report = BatchReport::default();
        if total == 0 {
            return report;
        }
        info!(requests = total, parallel = self.parallel_exports, "starting batch export");

        let mut queue: VecDeque<(ExportRequest, u32)> =
            requests.into_iter().map(|r| (r, 0)).collect();
        let mut in_flight: JoinSet<(ExportRequest, u32, Result<()>)> = JoinSet::new();
        let mut accepting = true;
        let mut completed = 0usize;

        while !queue.is_empty() || !in_flight.is_empty() {
            if cancel.is_cancelled() && accepting {
                accepting = false;
                while let Some((request, _)) = queue.pop_front() {
                    report.failed.push((request.id, "cancelled".to_string()));
                }
            }

            // Top up in-flight work; never more than the parallelism cap.
            while accepting && in_flight.len() < self.parallel_exports {
                let Some((request, attempt)) = queue.pop_front() else {
                    break;
                };
                let gate = self.gate.clone();
                let executor = executor.clone();
                let cancel = cancel.clone();
                let item_progress = ItemProgress {
                    sink: progress.clone(),
                    id: request.id.clone(),
                    completed_before: completed,
                    total,
                };
                in_flight.spawn(async move {
                    let ticket = gate
                        .acquire_with_timeout(JobKind::Export, GATE_ACQUIRE_TIMEOUT)
                        .await;
                    let result = match ticket {
                        Ok(_ticket) => executor.execute(&request, item_progress, &cancel).await,
                        Err(e) => Err(e),
                    };
                    (request, attempt, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                if !accepting {
                    while let Some((queued, _)) = queue.pop_front() {
                        report.failed.push((queued.id, "aborted".to_string()));
                    }
                }
                continue;
            };
            let (request, attempt, result) = match joined {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "batch worker panicked");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    completed += 1;
                    progress.report(completed as f64 / total as f64, "batch_export", &request.id);
                    report.successful.push(request.id);
                }
                Err(e) if e.is_cancelled() => {
                    report.failed.push((request.id, "cancelled".to_string()));
                }
                Err(e) => {
                    if accepting && self.config.retry_failed && attempt < self.config.max_retries {
                        warn!(request = %request.id, attempt = attempt + 1, error = %e, "re-enqueueing failed request");
                        queue.push_back((request, attempt + 1));
                    } else {
                        report.failed.push((request.id, e.user_message()));
                        if !self.config.continue_on_error && accepting {
                            // Stop admitting new work; whatever is already
                            // running finishes on its own.
                            accepting = false;
                            while let Some((queued, _)) = queue.pop_front() {
                                report
                                    .failed
                                    .push((queued.id, "aborted after sibling failure".to_string()));
                            }
                        }
                    }
                }
            }
        }

        info!(
            successful = report.successful.len(),
            failed = report.failed.len(),
            "batch export finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::monitor::ResourceMonitor;
    use crate::pipeline::NoopSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn requests(n: usize) -> Vec<ExportRequest> {
        (1..=n)
            .map(|i| ExportRequest {
                id: format!("req-{i}"),
                url: format!("https://example.test/v{i}"),
            })
            .collect()
    }

    fn exporter(parallel: usize, config: ExportConfig) -> BatchExporter {
        let gate = ResourceGate::new(
            ResourceMonitor::new(),
            ResourceConfig {
                max_parallel_exports: parallel,
                ..ResourceConfig::default()
            },
        );
        BatchExporter::new(gate, config, parallel)
    }

    /// Records the highest number of concurrent executions observed.
    struct TrackingExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
        fail_ids: Vec<String>,
    }

    impl TrackingExecutor {
        fn new(fail_ids: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_ids,
            })
        }
    }

    #[async_trait]
    impl ExportExecutor for TrackingExecutor {
        async fn execute(
            &self,
            request: &ExportRequest,
            progress: ItemProgress,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            progress.report(0.5);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail_ids.contains(&request.id) {
                Err(PipelineError::internal("scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_parallelism() {
        let exporter = exporter(2, ExportConfig::default());
        let executor = TrackingExecutor::new(Vec::new());

        let report = exporter
            .export_batch(
                requests(5),
                executor.clone(),
                Arc::new(NoopSink),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.successful.len(), 5);
        assert_eq!(report.total(), 5);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let config = ExportConfig {
            retry_failed: false,
            ..ExportConfig::default()
        };
        let exporter = exporter(2, config);
        let executor = TrackingExecutor::new(vec!["req-2".to_string()]);

        let report = exporter
            .export_batch(
                requests(4),
                executor,
                Arc::new(NoopSink),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.total(), 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "req-2");
    }

    #[tokio::test]
    async fn test_retry_failed_re_enqueues() {
        /// Fails each request once, then succeeds.
        struct FlakyExecutor {
            attempts: parking_lot::Mutex<std::collections::HashMap<String, u32>>,
        }

        #[async_trait]
        impl ExportExecutor for FlakyExecutor {
            async fn execute(
                &self,
                request: &ExportRequest,
                _progress: ItemProgress,
                _cancel: &CancellationToken,
            ) -> Result<()> {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(request.id.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    Err(PipelineError::internal("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        }

        let exporter = exporter(2, ExportConfig::default());
        let executor = Arc::new(FlakyExecutor {
            attempts: parking_lot::Mutex::new(std::collections::HashMap::new()),
        });

        let report = exporter
            .export_batch(
                requests(3),
                executor,
                Arc::new(NoopSink),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.successful.len(), 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_drains_queue() {
        let exporter = exporter(1, ExportConfig::default());
        let executor = TrackingExecutor::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = exporter
            .export_batch(requests(3), executor, Arc::new(NoopSink), &cancel)
            .await;

        assert_eq!(report.total(), 3);
        assert!(report.successful.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let exporter = exporter(2, ExportConfig::default());
        let executor = TrackingExecutor::new(Vec::new());
        let report = exporter
            .export_batch(Vec::new(), executor, Arc::new(NoopSink), &CancellationToken::new())
            .await;
        assert_eq!(report.total(), 0);
    }
}
