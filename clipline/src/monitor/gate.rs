//! Resource admission gate.
//!
//! Launching another heavyweight job (an export, an encode subprocess) is
//! gated on the latest resource sample and the live job registry. The
//! registry and the admission predicate share a single mutex so that a
//! ticket is only ever handed out while the predicate holds.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::ResourceMonitor;
use crate::config::ResourceConfig;
use crate::error::{ErrorKind, PipelineError, Result};

/// Poll interval while blocked on admission.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kind of job asking for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Export-style work (downloads, uploads, full pipeline runs).
    Export,
    /// Video encode subprocesses, additionally capped by
    /// `max_parallel_encodes`.
    Encode,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Export => f.write_str("export"),
            JobKind::Encode => f.write_str("encode"),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    active: usize,
    encodes: usize,
}

struct GateInner {
    monitor: ResourceMonitor,
    config: ResourceConfig,
    registry: Mutex<Registry>,
}

/// Admission controller for heavyweight jobs.
#[derive(Clone)]
pub struct ResourceGate {
    inner: Arc<GateInner>,
}

impl ResourceGate {
    pub fn new(monitor: ResourceMonitor, config: ResourceConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                monitor,
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Evaluate the admission predicate without registering a job.
    pub fn can_start(&self, kind: JobKind) -> bool {
        let registry = self.inner.registry.lock();
        self.admit(kind, &registry)
    }

    /// Try to register a job right now.
    pub fn try_acquire(&self, kind: JobKind) -> Option<Ticket> {
        let mut registry = self.inner.registry.lock();
        if !self.admit(kind, &registry) {
            return None;
        }
        registry.active += 1;
        if kind == JobKind::Encode {
            registry.encodes += 1;
        }
        trace!(kind = %kind, active = registry.active, "gate admitted job");
        Some(Ticket {
            inner: self.inner.clone(),
            kind,
        })
    }

    /// Block (polling at one-second intervals) until the predicate holds or
    /// the timeout elapses.
    pub async fn acquire_with_timeout(&self, kind: JobKind, timeout: Duration) -> Result<Ticket> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ticket) = self.try_acquire(kind) {
                return Ok(ticket);
            }
            if tokio::time::Instant::now() >= deadline {
                // Contention clears; worth one more pass through the stage
                // retry budget.
                return Err(PipelineError::new(
                    ErrorKind::ResourceExhausted,
                    format!("timed out waiting for {kind} admission after {timeout:?}"),
                )
                .retryable(true));
            }
            let wait = ACQUIRE_POLL_INTERVAL.min(deadline - tokio::time::Instant::now());
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of currently registered jobs.
    pub fn active_jobs(&self) -> usize {
        self.inner.registry.lock().active
    }

    fn admit(&self, kind: JobKind, registry: &Registry) -> bool {
        let config = &self.inner.config;
        if registry.active >= config.max_parallel_exports {
            return false;
        }
        if kind == JobKind::Encode && registry.encodes >= config.max_parallel_encodes {
            return false;
        }

        let snapshot = self.inner.monitor.snapshot();
        if snapshot.cpu_percent >= config.max_cpu_percent {
            debug!(cpu = snapshot.cpu_percent, "gate: cpu above threshold");
            return false;
        }
        if snapshot.memory_percent >= config.max_memory_percent {
            debug!(memory = snapshot.memory_percent, "gate: memory above threshold");
            return false;
        }
        if let Some(gpu) = snapshot.gpu {
            if gpu.utilization_percent >= config.max_gpu_percent {
                debug!(gpu = gpu.utilization_percent, "gate: gpu above threshold");
                return false;
            }
        }
        true
    }

}

/// Proof of admission. Releasing is mandatory and happens on drop.
pub struct Ticket {
    inner: Arc<GateInner>,
    kind: JobKind,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut registry = self.inner.registry.lock();
        registry.active = registry.active.saturating_sub(1);
        if self.kind == JobKind::Encode {
            registry.encodes = registry.encodes.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ResourceSnapshot;

    fn gate_with(config: ResourceConfig) -> ResourceGate {
        ResourceGate::new(ResourceMonitor::new(), config)
    }

    #[test]
    fn test_parallel_export_cap() {
        let gate = gate_with(ResourceConfig {
            max_parallel_exports: 2,
            ..ResourceConfig::default()
        });

        let t1 = gate.try_acquire(JobKind::Export).unwrap();
        let _t2 = gate.try_acquire(JobKind::Export).unwrap();
        assert!(gate.try_acquire(JobKind::Export).is_none());

        drop(t1);
        assert!(gate.try_acquire(JobKind::Export).is_some());
    }

    #[test]
    fn test_encode_cap_separate_from_export_cap() {
        let gate = gate_with(ResourceConfig {
            max_parallel_exports: 4,
            max_parallel_encodes: 1,
            ..ResourceConfig::default()
        });

        let _enc = gate.try_acquire(JobKind::Encode).unwrap();
        assert!(gate.try_acquire(JobKind::Encode).is_none());
        // Non-encode jobs are still admitted.
        assert!(gate.try_acquire(JobKind::Export).is_some());
    }

    #[test]
    fn test_cpu_threshold_blocks_admission() {
        let monitor = ResourceMonitor::new();
        monitor.publish(ResourceSnapshot {
            cpu_percent: 95.0,
            ..ResourceSnapshot::default()
        });
        let gate = ResourceGate::new(monitor.clone(), ResourceConfig::default());
        assert!(!gate.can_start(JobKind::Export));

        monitor.publish(ResourceSnapshot::default());
        assert!(gate.can_start(JobKind::Export));
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let gate = gate_with(ResourceConfig {
            max_parallel_exports: 1,
            ..ResourceConfig::default()
        });
        let _held = gate.try_acquire(JobKind::Export).unwrap();

        let err = gate
            .acquire_with_timeout(JobKind::Export, Duration::from_millis(120))
            .await
            .err()
            .expect("acquire must time out");
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_acquire_succeeds_after_release() {
        let gate = gate_with(ResourceConfig {
            max_parallel_exports: 1,
            ..ResourceConfig::default()
        });
        let held = gate.try_acquire(JobKind::Export).unwrap();

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            gate2
                .acquire_with_timeout(JobKind::Export, Duration::from_secs(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let ticket = waiter.await.unwrap();
        assert!(ticket.is_ok());
        assert_eq!(gate.active_jobs(), 1);
    }
}
