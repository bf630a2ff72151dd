//! Resource monitoring.
//!
//! A dedicated sampling task refreshes CPU, memory and disk I/O figures
//! once per second and publishes the latest snapshot. Readers never block
//! on sampling; they only take a short lock to clone the snapshot.

pub mod gate;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use gate::{JobKind, ResourceGate, Ticket};

/// Sampling interval.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// GPU figures from an optional external probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub utilization_percent: f32,
    pub memory_percent: f32,
}

/// Optional GPU sampling hook. There is no portable GPU story in sysinfo,
/// so callers with a GPU supply their own probe.
pub trait GpuProbe: Send + Sync {
    fn sample(&self) -> Option<GpuSample>;
}

/// The most recent resource sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub available_memory_bytes: u64,
    pub disk_read_bytes_per_s: f64,
    pub disk_write_bytes_per_s: f64,
    pub gpu: Option<GpuSample>,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            available_memory_bytes: u64::MAX,
            disk_read_bytes_per_s: 0.0,
            disk_write_bytes_per_s: 0.0,
            gpu: None,
        }
    }
}

struct MonitorShared {
    snapshot: Mutex<ResourceSnapshot>,
    gpu_probe: Option<Box<dyn GpuProbe>>,
}

/// Periodic system resource sampler with explicit lifecycle.
///
/// The coordinator owns start and stop; everything else reads snapshots
/// through a cheap clone of the handle. A stopped monitor can be started
/// again.
#[derive(Clone)]
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    worker: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_gpu_probe(None)
    }

    pub fn with_gpu_probe(gpu_probe: Option<Box<dyn GpuProbe>>) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                snapshot: Mutex::new(ResourceSnapshot::default()),
                gpu_probe,
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the sampling task. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let token = CancellationToken::new();
        let task_token = token.clone();
        info!("starting resource monitor");

        let handle = tokio::spawn(async move {
            let token = task_token;
            let mut system = System::new();
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("resource monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                system.refresh_cpu_usage();
                system.refresh_memory();
                system.refresh_processes(ProcessesToUpdate::All, true);

                let total = system.total_memory();
                let used = system.used_memory();
                let memory_percent = if total == 0 {
                    0.0
                } else {
                    (used as f64 / total as f64 * 100.0) as f32
                };

                // sysinfo reports per-process byte deltas since the previous
                // refresh; summed and divided by the interval they become
                // system-wide rates.
                let mut read_delta = 0u64;
                let mut write_delta = 0u64;
                for process in system.processes().values() {
                    let usage = process.disk_usage();
                    read_delta = read_delta.saturating_add(usage.read_bytes);
                    write_delta = write_delta.saturating_add(usage.written_bytes);
                }
                let secs = SAMPLE_INTERVAL.as_secs_f64();

                let sample = ResourceSnapshot {
                    cpu_percent: system.global_cpu_usage(),
                    memory_percent,
                    available_memory_bytes: system.available_memory(),
                    disk_read_bytes_per_s: read_delta as f64 / secs,
                    disk_write_bytes_per_s: write_delta as f64 / secs,
                    gpu: shared.gpu_probe.as_ref().and_then(|p| p.sample()),
                };

                *shared.snapshot.lock() = sample;
            }
        });
        *worker = Some((token, handle));
    }

    /// Stop the sampling task and wait for it to exit.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }

    /// The most recent sample. Never blocks on sampling.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.shared.snapshot.lock().clone()
    }

    /// Replace the published snapshot. Test hook for deterministic gating.
    #[doc(hidden)]
    pub fn publish(&self, snapshot: ResourceSnapshot) {
        *self.shared.snapshot.lock() = snapshot;
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_permissive() {
        let snapshot = ResourceSnapshot::default();
        assert_eq!(snapshot.cpu_percent, 0.0);
        assert_eq!(snapshot.memory_percent, 0.0);
        assert!(snapshot.gpu.is_none());
    }

    #[tokio::test]
    async fn test_publish_and_read() {
        let monitor = ResourceMonitor::new();
        monitor.publish(ResourceSnapshot {
            cpu_percent: 42.0,
            ..ResourceSnapshot::default()
        });
        assert_eq!(monitor.snapshot().cpu_percent, 42.0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let monitor = ResourceMonitor::new();
        monitor.stop().await;
    }

    struct FixedGpu;

    impl GpuProbe for FixedGpu {
        fn sample(&self) -> Option<GpuSample> {
            Some(GpuSample {
                utilization_percent: 10.0,
                memory_percent: 20.0,
            })
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let monitor = ResourceMonitor::with_gpu_probe(Some(Box::new(FixedGpu)));
        monitor.start();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let monitor = ResourceMonitor::new();
        monitor.start();
        monitor.stop().await;
        monitor.start();
        monitor.stop().await;
    }
}
