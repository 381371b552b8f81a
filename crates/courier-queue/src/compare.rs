//! Dispatch-ranking comparers.
//!
//! Pure ordering functions over health snapshots. All comparers order
//! "most available first": `Ordering::Less` means the left side should be
//! dispatched to before the right side.

use std::cmp::Ordering;

use crate::state::QueueState;

/// Ranks queue workers for dispatch.
///
/// Layered key, most available first: non-aborted before aborted (an
/// aborted queue always ranks last regardless of its other metrics), then
/// lower failure rate, then shorter backlog, then lower combined latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueAvailabilityComparer;

impl QueueAvailabilityComparer {
    pub fn compare(&self, a: &QueueState, b: &QueueState) -> Ordering {
        a.aborted
            .cmp(&b.aborted)
            .then_with(|| {
                a.failure_rate
                    .partial_cmp(&b.failure_rate)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.queue_length.cmp(&b.queue_length))
            .then_with(|| a.total_latency_us().cmp(&b.total_latency_us()))
    }
}

/// A component exposing the weights of its resource monitors, in
/// registration order. Lower weight means more available.
pub trait ResourceWeighted {
    fn monitor_weights(&self) -> Vec<u32>;
}

/// Weighting strategy for [`ComponentAvailabilityComparer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightStrategy {
    /// Sum of all monitor weights.
    TotalWeight,
    /// Lexicographic comparison of each monitor's weight in registration
    /// order, short-circuiting on the first difference.
    RankedWeight,
    /// Progressive comparison of cumulative running sums, short-circuiting
    /// on the first differing partial sum.
    RankedTotalWeight,
}

/// Ranks components composed of multiple weighted resource monitors.
#[derive(Debug, Clone, Copy)]
pub struct ComponentAvailabilityComparer {
    strategy: WeightStrategy,
}

impl ComponentAvailabilityComparer {
    pub fn new(strategy: WeightStrategy) -> Self {
        Self { strategy }
    }

    pub fn compare<T: ResourceWeighted>(&self, a: &T, b: &T) -> Ordering {
        let wa = a.monitor_weights();
        let wb = b.monitor_weights();

        match self.strategy {
            WeightStrategy::TotalWeight => {
                let ta: u64 = wa.iter().map(|w| u64::from(*w)).sum();
                let tb: u64 = wb.iter().map(|w| u64::from(*w)).sum();
                ta.cmp(&tb)
            }
            WeightStrategy::RankedWeight => {
                for (x, y) in wa.iter().zip(wb.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                wa.len().cmp(&wb.len())
            }
            WeightStrategy::RankedTotalWeight => {
                let mut sum_a: u64 = 0;
                let mut sum_b: u64 = 0;
                for (x, y) in wa.iter().zip(wb.iter()) {
                    sum_a += u64::from(*x);
                    sum_b += u64::from(*y);
                    match sum_a.cmp(&sum_b) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                wa.len().cmp(&wb.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn queue(aborted: bool, failure_rate: f64, backlog: usize, latency: u64) -> QueueState {
        QueueState {
            instance_id: Uuid::new_v4(),
            route: "r".to_string(),
            busy: false,
            aborted,
            queue_length: backlog,
            avg_request_latency_us: latency,
            avg_response_latency_us: 0,
            failure_rate,
            messages_processed: 0,
            message_requests: 0,
        }
    }

    #[test]
    fn aborted_queue_always_ranks_last() {
        let cmp = QueueAvailabilityComparer;
        // Perfect metrics on the aborted queue still lose.
        let aborted = queue(true, 0.0, 0, 0);
        let healthy = queue(false, 0.9, 100, 50_000);
        assert_eq!(cmp.compare(&healthy, &aborted), Ordering::Less);
        assert_eq!(cmp.compare(&aborted, &healthy), Ordering::Greater);
    }

    #[test]
    fn lower_failure_rate_wins_before_backlog() {
        let cmp = QueueAvailabilityComparer;
        let clean_but_deep = queue(false, 0.0, 40, 0);
        let failing_but_empty = queue(false, 0.5, 0, 0);
        assert_eq!(cmp.compare(&clean_but_deep, &failing_but_empty), Ordering::Less);
    }

    #[test]
    fn backlog_then_latency_break_ties() {
        let cmp = QueueAvailabilityComparer;
        let short = queue(false, 0.1, 1, 900);
        let long = queue(false, 0.1, 5, 100);
        assert_eq!(cmp.compare(&short, &long), Ordering::Less);

        let slow = queue(false, 0.1, 1, 5_000);
        let fast = queue(false, 0.1, 1, 200);
        assert_eq!(cmp.compare(&fast, &slow), Ordering::Less);
    }

    struct Component(Vec<u32>);

    impl ResourceWeighted for Component {
        fn monitor_weights(&self) -> Vec<u32> {
            self.0.clone()
        }
    }

    #[test]
    fn total_weight_sums_all_monitors() {
        let cmp = ComponentAvailabilityComparer::new(WeightStrategy::TotalWeight);
        let light = Component(vec![10, 10, 10]);
        let heavy = Component(vec![1, 1, 40]);
        assert_eq!(cmp.compare(&light, &heavy), Ordering::Less);
    }

    #[test]
    fn ranked_weight_short_circuits_on_first_difference() {
        let cmp = ComponentAvailabilityComparer::new(WeightStrategy::RankedWeight);
        // First monitor decides, even though the total goes the other way.
        let a = Component(vec![1, 100, 100]);
        let b = Component(vec![2, 0, 0]);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn ranked_total_weight_compares_partial_sums() {
        let cmp = ComponentAvailabilityComparer::new(WeightStrategy::RankedTotalWeight);
        // Partial sums: [5, 10, ...] vs [5, 12, ...] - second step decides.
        let a = Component(vec![5, 5, 50]);
        let b = Component(vec![5, 7, 0]);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        // Equal running sums all the way through compare as equal.
        let c = Component(vec![3, 3]);
        let d = Component(vec![3, 3]);
        assert_eq!(cmp.compare(&c, &d), Ordering::Equal);
    }
}
