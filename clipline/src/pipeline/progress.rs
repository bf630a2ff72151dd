//! Progress reporting.
//!
//! A [`ProgressSink`] travels down the call tree; the sink wrapper owns
//! throttling and thread safety, so workers can report freely from any
//! task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::checkpoint::Stage;

/// Maximum delivery rate to the underlying sink.
const MAX_REPORT_RATE: Duration = Duration::from_millis(200);

/// Receives `(overall progress, stage label, detail)` updates.
///
/// Implementations must be safe to invoke from any worker.
pub trait ProgressSink: Send + Sync {
    fn report(&self, overall: f64, stage: &str, detail: &str);
}

/// Sink that swallows all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn report(&self, _overall: f64, _stage: &str, _detail: &str) {}
}

/// Rate-limits delivery to at most 5 Hz, always letting terminal updates
/// (progress 0 or 1) through so stage boundaries are never dropped.
pub struct ThrottledSink {
    inner: Arc<dyn ProgressSink>,
    last_delivery: Mutex<Option<Instant>>,
}

impl ThrottledSink {
    pub fn new(inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            inner,
            last_delivery: Mutex::new(None),
        }
    }
}

impl ProgressSink for ThrottledSink {
    fn report(&self, overall: f64, stage: &str, detail: &str) {
        let boundary = overall <= 0.0 || overall >= 1.0;
        {
            let mut last = self.last_delivery.lock();
            let now = Instant::now();
            if !boundary {
                if let Some(prev) = *last {
                    if now.duration_since(prev) < MAX_REPORT_RATE {
                        return;
                    }
                }
            }
            *last = Some(now);
        }
        self.inner.report(overall, stage, detail);
    }
}

/// Static stage weights for overall progress aggregation.
pub fn stage_weight(stage: Stage) -> f64 {
    match stage {
        Stage::Fetch => 0.05,
        Stage::ExtractAudio => 0.05,
        Stage::Transcribe => 0.25,
        Stage::Analyze => 0.10,
        Stage::AwaitUserSelection => 0.0,
        Stage::Translate => 0.20,
        Stage::GenerateSubtitles => 0.05,
        Stage::EditVideo => 0.20,
        Stage::Export => 0.10,
        _ => 0.0,
    }
}

/// Overall progress: completed stage weights plus the weighted progress of
/// the current stage.
pub fn overall_progress(stage: Stage, stage_progress: f64) -> f64 {
    if stage.is_terminal() {
        return 1.0;
    }
    let mut completed = 0.0;
    let mut cursor = Stage::Pending;
    while let Some(next) = cursor.next() {
        if next.index() >= stage.index() {
            break;
        }
        completed += stage_weight(next);
        cursor = next;
    }
    (completed + stage_weight(stage) * stage_progress.clamp(0.0, 1.0)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_weights_sum_to_one() {
        let mut total = 0.0;
        let mut stage = Stage::Pending;
        while let Some(next) = stage.next() {
            total += stage_weight(next);
            stage = next;
        }
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_progress_monotonic_across_stages() {
        let halfway_fetch = overall_progress(Stage::Fetch, 0.5);
        let start_translate = overall_progress(Stage::Translate, 0.0);
        let end_translate = overall_progress(Stage::Translate, 1.0);
        assert!(halfway_fetch < start_translate);
        assert!(start_translate < end_translate);
        assert_eq!(overall_progress(Stage::Completed, 0.0), 1.0);
    }

    #[test]
    fn test_overall_progress_at_export_end() {
        assert!((overall_progress(Stage::Export, 1.0) - 1.0).abs() < 1e-9);
    }

    struct CountingSink(AtomicUsize);

    impl ProgressSink for CountingSink {
        fn report(&self, _overall: f64, _stage: &str, _detail: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_throttle_caps_rate() {
        let counter = Arc::new(CountingSink(AtomicUsize::new(0)));
        let sink = ThrottledSink::new(counter.clone());
        for _ in 0..100 {
            sink.report(0.5, "translate", "item");
        }
        // First report goes through, the burst is swallowed.
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throttle_lets_boundaries_through() {
        let counter = Arc::new(CountingSink(AtomicUsize::new(0)));
        let sink = ThrottledSink::new(counter.clone());
        sink.report(0.0, "fetch", "start");
        sink.report(1.0, "export", "done");
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
