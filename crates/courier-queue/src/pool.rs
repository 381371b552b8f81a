//! PriorityQueuePool - one logical route backed by N elastic workers.
//!
//! The pool runs no loop of its own; it multiplexes across its workers'
//! consumption loops. Selection-and-possibly-create is a single critical
//! section so concurrent senders can never race past the queue-count cap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use courier_common::{PoolSettings, RouteEntry, SendError};

use crate::compare::QueueAvailabilityComparer;
use crate::policy::QueuingPolicy;
use crate::route::{MessageRoute, PriorityQueueRoute};
use crate::state::PoolState;

/// Constructs a new worker for the pool on demand. Explicit factory rather
/// than runtime type lookup; each call must return a freshly started
/// worker.
pub trait RouteFactory: Send + Sync {
    fn create(&self) -> Arc<PriorityQueueRoute>;
}

impl<F> RouteFactory for F
where
    F: Fn() -> Arc<PriorityQueueRoute> + Send + Sync,
{
    fn create(&self) -> Arc<PriorityQueueRoute> {
        self()
    }
}

/// Elastic pool of [`PriorityQueueRoute`] workers behind a single route
/// surface.
pub struct PriorityQueuePool {
    name: String,
    settings: PoolSettings,
    workers: Mutex<Vec<Arc<PriorityQueueRoute>>>,
    policy: Arc<dyn QueuingPolicy>,
    factory: Arc<dyn RouteFactory>,
    comparer: QueueAvailabilityComparer,
    highest_concurrency: AtomicUsize,
    cancelled: AtomicBool,
}

impl PriorityQueuePool {
    pub fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        policy: Arc<dyn QueuingPolicy>,
        factory: Arc<dyn RouteFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            workers: Mutex::new(Vec::new()),
            policy,
            factory,
            comparer: QueueAvailabilityComparer,
            highest_concurrency: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Dispatch a message to the most-available worker, creating one first
    /// when the admission policy and headroom allow it.
    pub fn dispatch(&self, entry: RouteEntry) -> Result<(), SendError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SendError::Rejected(format!(
                "pool '{}' is cancelled",
                self.name
            )));
        }

        let mut workers = self.workers.lock();

        // Aborted workers are dead; retire them so admission can replace
        // them.
        let before = workers.len();
        workers.retain(|w| !w.is_aborted());
        if workers.len() < before {
            warn!(
                pool = %self.name,
                retired = before - workers.len(),
                "Retired aborted workers"
            );
        }

        let state = Self::snapshot(&self.name, &workers, &self.highest_concurrency);
        let decision = self.policy.allow_queue_creation(&state);
        if decision.allow && workers.len() < self.settings.max_queue_count {
            let worker = self.factory.create();
            debug!(
                pool = %self.name,
                instance_id = %worker.instance_id(),
                reason = %decision.reason,
                queue_count = workers.len() + 1,
                "Created pool worker"
            );
            workers.push(worker);
            self.highest_concurrency
                .fetch_max(workers.len(), Ordering::SeqCst);
            gauge!("courier_pool_queue_count", "pool" => self.name.clone())
                .set(workers.len() as f64);
        }

        if workers.is_empty() {
            return Err(SendError::Rejected(format!(
                "pool '{}' has no workers and admission denied creation: {}",
                self.name, decision.reason
            )));
        }

        // Rank by availability; the comparer puts aborted workers last.
        let mut ranked: Vec<Arc<PriorityQueueRoute>> = workers.clone();
        ranked.sort_by(|a, b| self.comparer.compare(&a.state(), &b.state()));
        drop(workers);

        let best = ranked
            .into_iter()
            .find(|w| !w.is_aborted())
            .ok_or_else(|| {
                SendError::Rejected(format!(
                    "pool '{}' has no non-aborted worker available",
                    self.name
                ))
            })?;

        best.enqueue(entry).map_err(|e| match e {
            // Lost the race against an abort between ranking and enqueue.
            // The submitter goes through its failure policy like any other
            // stage failure.
            SendError::Aborted { .. } => {
                warn!(pool = %self.name, "Worker aborted mid-dispatch");
                SendError::Rejected(format!(
                    "pool '{}' worker aborted during dispatch",
                    self.name
                ))
            }
            other => other,
        })
    }

    /// Retire idle zero-backlog workers down to the policy's trim target.
    pub fn trim_idle_queues(&self) {
        let Some(min) = self.policy.trim_target() else {
            return;
        };

        let removed: Vec<Arc<PriorityQueueRoute>> = {
            let mut workers = self.workers.lock();
            let mut removed = Vec::new();
            while workers.len() > min {
                let idle = workers
                    .iter()
                    .position(|w| w.queue_length() == 0 && !w.is_busy());
                match idle {
                    Some(i) => removed.push(workers.remove(i)),
                    None => break,
                }
            }
            removed
        };

        for worker in &removed {
            worker.cancel();
        }
        if !removed.is_empty() {
            info!(pool = %self.name, trimmed = removed.len(), "Trimmed idle workers");
        }
    }

    fn snapshot(
        name: &str,
        workers: &[Arc<PriorityQueueRoute>],
        highest: &AtomicUsize,
    ) -> PoolState {
        PoolState {
            route: name.to_string(),
            queue_count: workers.len(),
            highest_concurrency: highest.load(Ordering::SeqCst),
            states: workers.iter().map(|w| w.state()).collect(),
        }
    }

    /// Aggregate snapshot of the pool and its workers.
    pub fn state(&self) -> PoolState {
        let workers = self.workers.lock();
        Self::snapshot(&self.name, &workers, &self.highest_concurrency)
    }

    pub fn queue_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Maximum queue count ever observed; never decreases.
    pub fn highest_concurrency(&self) -> usize {
        self.highest_concurrency.load(Ordering::SeqCst)
    }

    /// Cancel every worker. No further messages are accepted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self.workers.lock().clone();
        for worker in workers {
            worker.cancel();
        }
    }

    /// Cancel and wait for every worker loop to exit inside the timeout.
    /// All must make it for the result to be `true`.
    pub async fn cancel_timeout(&self, timeout: Duration) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self.workers.lock().clone();
        let deadline = Instant::now() + timeout;
        let mut all = true;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            all &= worker.cancel_timeout(remaining).await;
        }
        all
    }

    /// Wait until every worker is drained and idle, or the timeout
    /// elapses. All must complete for the result to be `true`.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let workers: Vec<_> = self.workers.lock().clone();
        let deadline = Instant::now() + timeout;
        let mut all = true;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            all &= worker.wait_for_completion(remaining).await;
        }
        all
    }
}

#[async_trait]
impl MessageRoute for PriorityQueuePool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, entry: RouteEntry) -> Result<(), SendError> {
        self.dispatch(entry)
    }
}
