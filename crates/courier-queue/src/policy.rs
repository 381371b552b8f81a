//! Admission-control policies consulted before a pool creates a worker.

use std::sync::Arc;

use tracing::debug;

use courier_common::PolicyDecision;

use crate::state::PoolState;

/// Decides whether a pool may create another worker queue.
pub trait QueuingPolicy: Send + Sync {
    fn allow_queue_creation(&self, pool: &PoolState) -> PolicyDecision;

    /// When `Some(min)`, the pool may retire zero-backlog idle workers down
    /// to `min`.
    fn trim_target(&self) -> Option<usize> {
        None
    }
}

/// Fixed-bounds admission: create a worker whenever the pool is empty, or
/// every existing worker is occupied and headroom remains.
#[derive(Debug, Clone)]
pub struct StaticQueuingPolicy {
    pub min_queue_count: usize,
    pub max_queue_count: usize,
    pub trim_idle_queues: bool,
}

impl StaticQueuingPolicy {
    pub fn new(min_queue_count: usize, max_queue_count: usize) -> Self {
        Self {
            min_queue_count,
            max_queue_count,
            trim_idle_queues: false,
        }
    }

    pub fn with_trim(mut self) -> Self {
        self.trim_idle_queues = true;
        self
    }
}

impl QueuingPolicy for StaticQueuingPolicy {
    fn allow_queue_creation(&self, pool: &PoolState) -> PolicyDecision {
        if pool.queue_count == 0 {
            return PolicyDecision::allow("pool is empty");
        }
        if pool.queue_count >= self.max_queue_count {
            return PolicyDecision::deny("max queue count reached");
        }
        if pool.all_busy() {
            return PolicyDecision::allow("all workers occupied, headroom remains");
        }
        PolicyDecision::deny("an idle worker is available")
    }

    fn trim_target(&self) -> Option<usize> {
        self.trim_idle_queues.then_some(self.min_queue_count)
    }
}

/// Supplies a restartable snapshot of recent CPU-utilization percentage
/// samples. Consumed read-only.
pub trait PerformanceMonitor: Send + Sync {
    fn processor_usage_samples(&self) -> Vec<f64>;
}

/// Resource-coupled admission: deny creation while the recent average CPU
/// sample is over the threshold, and otherwise allow whenever headroom
/// exists, regardless of worker occupancy. Back-pressure tracks host
/// pressure instead of a fixed cap alone.
pub struct LimitedResourceQueuingPolicy {
    monitor: Arc<dyn PerformanceMonitor>,
    cpu_threshold: f64,
    sample_window: usize,
    max_queue_count: usize,
}

impl LimitedResourceQueuingPolicy {
    pub const DEFAULT_CPU_THRESHOLD: f64 = 75.0;
    pub const DEFAULT_SAMPLE_WINDOW: usize = 5;

    pub fn new(monitor: Arc<dyn PerformanceMonitor>, max_queue_count: usize) -> Self {
        Self {
            monitor,
            cpu_threshold: Self::DEFAULT_CPU_THRESHOLD,
            sample_window: Self::DEFAULT_SAMPLE_WINDOW,
            max_queue_count,
        }
    }

    pub fn with_threshold(mut self, cpu_threshold: f64) -> Self {
        self.cpu_threshold = cpu_threshold;
        self
    }

    pub fn with_sample_window(mut self, sample_window: usize) -> Self {
        self.sample_window = sample_window.max(1);
        self
    }

    fn recent_average(&self) -> Option<f64> {
        let samples = self.monitor.processor_usage_samples();
        if samples.is_empty() {
            return None;
        }
        let window: Vec<f64> = samples
            .iter()
            .rev()
            .take(self.sample_window)
            .copied()
            .collect();
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

impl QueuingPolicy for LimitedResourceQueuingPolicy {
    fn allow_queue_creation(&self, pool: &PoolState) -> PolicyDecision {
        if pool.queue_count >= self.max_queue_count {
            return PolicyDecision::deny("max queue count reached");
        }

        match self.recent_average() {
            Some(avg) if avg > self.cpu_threshold => {
                debug!(
                    route = %pool.route,
                    avg_cpu = avg,
                    threshold = self.cpu_threshold,
                    "Admission denied on processor pressure"
                );
                PolicyDecision::deny(format!(
                    "processor usage {avg:.1}% over threshold {:.1}%",
                    self.cpu_threshold
                ))
            }
            Some(avg) => PolicyDecision::allow(format!(
                "processor usage {avg:.1}% under threshold {:.1}%",
                self.cpu_threshold
            )),
            // No samples available counts as no pressure.
            None => PolicyDecision::allow("no processor samples available"),
        }
    }
}
