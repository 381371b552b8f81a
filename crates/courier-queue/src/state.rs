//! Read-only health snapshots published by workers and pools.

use serde::Serialize;
use uuid::Uuid;

/// Live health snapshot of one priority queue worker.
///
/// Counters are monotonic until the worker is retired;
/// `messages_processed <= message_requests` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub instance_id: Uuid,
    pub route: String,
    pub busy: bool,
    pub aborted: bool,
    pub queue_length: usize,
    /// Average enqueue-to-dequeue delay in microseconds.
    pub avg_request_latency_us: u64,
    /// Average dequeue-to-completion delay in microseconds.
    pub avg_response_latency_us: u64,
    pub failure_rate: f64,
    pub messages_processed: u64,
    pub message_requests: u64,
}

impl QueueState {
    /// Combined latency figure used as the final availability tie-break.
    pub fn total_latency_us(&self) -> u64 {
        self.avg_request_latency_us + self.avg_response_latency_us
    }
}

/// Aggregate snapshot of a queue pool. `queue_count == states.len()` at
/// every observation point.
#[derive(Debug, Clone, Serialize)]
pub struct PoolState {
    pub route: String,
    pub queue_count: usize,
    /// Maximum queue count ever observed; never decreases.
    pub highest_concurrency: usize,
    pub states: Vec<QueueState>,
}

impl PoolState {
    pub fn all_busy(&self) -> bool {
        self.states.iter().all(|s| s.busy || s.aborted)
    }

    pub fn total_backlog(&self) -> usize {
        self.states.iter().map(|s| s.queue_length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(busy: bool, aborted: bool, backlog: usize) -> QueueState {
        QueueState {
            instance_id: Uuid::new_v4(),
            route: "r".to_string(),
            busy,
            aborted,
            queue_length: backlog,
            avg_request_latency_us: 0,
            avg_response_latency_us: 0,
            failure_rate: 0.0,
            messages_processed: 0,
            message_requests: 0,
        }
    }

    #[test]
    fn all_busy_counts_aborted_workers_as_unavailable() {
        let pool = PoolState {
            route: "r".to_string(),
            queue_count: 2,
            highest_concurrency: 2,
            states: vec![state(true, false, 1), state(false, true, 0)],
        };
        assert!(pool.all_busy());
        assert_eq!(pool.total_backlog(), 1);
    }
}
