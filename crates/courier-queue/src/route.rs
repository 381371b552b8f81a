//! PriorityQueueRoute - single-consumer worker over a priority queue
//!
//! Producers enqueue from arbitrary tasks and return immediately; one
//! dedicated consumption loop dequeues in comparer order, invokes the
//! injected processor, and answers through each entry's oneshot. A
//! recognized business failure is telemetry; an unhandled fault is fatal to
//! the worker and surfaces every still-queued message as pending items.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_common::{Message, RouteEntry, RouteFault, SendError, StageOutcome};

use crate::state::QueueState;

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Per-message processing step behind a route.
///
/// `Ok(StageOutcome::Failed)` is a recognized business failure: it counts
/// toward the failure rate and the loop continues. `Err(RouteFault)` is an
/// unhandled fault and aborts the worker.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Arc<dyn Message>) -> Result<StageOutcome, RouteFault>;
}

/// One stage in a message's processing path. Implemented by
/// [`PriorityQueueRoute`] and [`crate::PriorityQueuePool`].
#[async_trait]
pub trait MessageRoute: Send + Sync {
    fn name(&self) -> &str;
    async fn send_message(&self, entry: RouteEntry) -> Result<(), SendError>;
}

/// Dequeue-order comparer. `Ordering::Less` means the left message is more
/// urgent. Implementations must break remaining ties by message identity so
/// dequeue order stays deterministic.
pub trait PriorityComparer: Send + Sync {
    fn compare(&self, a: &dyn Message, b: &dyn Message) -> CmpOrdering;
}

/// Default ordering: deadline minus escalation threshold, then deadline,
/// then request time, then identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineComparer;

impl PriorityComparer for DeadlineComparer {
    fn compare(&self, a: &dyn Message, b: &dyn Message) -> CmpOrdering {
        let urgency_a = a.deadline() - a.escalation_threshold();
        let urgency_b = b.deadline() - b.escalation_threshold();
        urgency_a
            .cmp(&urgency_b)
            .then_with(|| a.deadline().cmp(&b.deadline()))
            .then_with(|| a.request_time().cmp(&b.request_time()))
            .then_with(|| a.id().cmp(&b.id()))
    }
}

/// Report raised when a worker aborts: the fault plus every message that
/// was still queued (never processed) at the moment of failure.
#[derive(Debug)]
pub struct RouteAbort {
    pub route: String,
    pub instance_id: Uuid,
    pub fault: RouteFault,
    pub pending: Vec<Arc<dyn Message>>,
}

/// Receives the abort report of a worker. The pool registers itself here to
/// recover pending work.
pub trait AbortListener: Send + Sync {
    fn on_process_stopped(&self, abort: RouteAbort);
}

struct HeapItem {
    entry: RouteEntry,
    comparer: Arc<dyn PriorityComparer>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap pops the maximum; the comparer puts the most urgent
        // message first, so reverse it.
        self.comparer
            .compare(&*self.entry.message, &*other.entry.message)
            .reverse()
    }
}

/// A single elastic worker processing one message at a time from an
/// internal priority queue.
pub struct PriorityQueueRoute {
    name: String,
    instance_id: Uuid,
    heap: Mutex<BinaryHeap<HeapItem>>,
    wakeup: Notify,
    comparer: Arc<dyn PriorityComparer>,
    processor: Arc<dyn MessageProcessor>,
    abort_listener: Option<Arc<dyn AbortListener>>,

    busy: AtomicBool,
    aborted: AtomicBool,
    cancelled: AtomicBool,
    stopped: AtomicBool,

    message_requests: AtomicU64,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    request_latency_total_us: AtomicU64,
    response_latency_total_us: AtomicU64,
}

impl PriorityQueueRoute {
    /// Create the worker and spawn its consumption loop.
    pub fn start(
        name: impl Into<String>,
        processor: Arc<dyn MessageProcessor>,
        comparer: Arc<dyn PriorityComparer>,
        abort_listener: Option<Arc<dyn AbortListener>>,
    ) -> Arc<Self> {
        let route = Arc::new(Self {
            name: name.into(),
            instance_id: Uuid::new_v4(),
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            comparer,
            processor,
            abort_listener,
            busy: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            message_requests: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            request_latency_total_us: AtomicU64::new(0),
            response_latency_total_us: AtomicU64::new(0),
        });

        let worker = route.clone();
        tokio::spawn(async move {
            worker.run().await;
        });

        debug!(route = %route.name, instance_id = %route.instance_id, "Queue route started");
        route
    }

    /// Enqueue a message for processing. Non-blocking; ordering is decided
    /// by the configured comparer, not arrival order.
    ///
    /// The abort/cancel checks and the push share one heap critical
    /// section. Abort and cancel both set their flag before draining the
    /// heap under the same lock, so a successfully pushed entry is always
    /// either processed or swept into the drain; it can never strand in a
    /// heap no loop will pop.
    pub fn enqueue(&self, entry: RouteEntry) -> Result<(), SendError> {
        let mut heap = self.heap.lock();
        if self.aborted.load(Ordering::SeqCst) {
            return Err(SendError::Aborted {
                route: self.name.clone(),
            });
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SendError::Rejected(format!(
                "route '{}' is cancelled",
                self.name
            )));
        }

        self.message_requests.fetch_add(1, Ordering::SeqCst);
        heap.push(HeapItem {
            entry,
            comparer: self.comparer.clone(),
        });
        drop(heap);
        self.wakeup.notify_one();
        Ok(())
    }

    async fn run(&self) {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            // Raise `busy` while still holding the heap lock so a waiter
            // can never observe an empty queue with nothing in flight while
            // a message is actually mid-processing.
            let item = {
                let mut heap = self.heap.lock();
                let item = heap.pop();
                if item.is_some() {
                    self.busy.store(true, Ordering::SeqCst);
                }
                item
            };
            let Some(item) = item else {
                if self.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                self.wakeup.notified().await;
                continue;
            };

            let request_latency = item.entry.enqueued_at.elapsed();
            self.request_latency_total_us
                .fetch_add(request_latency.as_micros() as u64, Ordering::SeqCst);
            let dequeued_at = Instant::now();
            let message = item.entry.message.clone();
            let result = self.processor.process(&message).await;
            let response_latency = dequeued_at.elapsed();

            match result {
                Ok(outcome) => {
                    self.messages_processed.fetch_add(1, Ordering::SeqCst);
                    self.response_latency_total_us
                        .fetch_add(response_latency.as_micros() as u64, Ordering::SeqCst);

                    counter!("courier_route_messages_processed", "route" => self.name.clone())
                        .increment(1);
                    histogram!("courier_route_response_latency_us", "route" => self.name.clone())
                        .record(response_latency.as_micros() as f64);

                    if let StageOutcome::Failed(ref err) = outcome {
                        self.messages_failed.fetch_add(1, Ordering::SeqCst);
                        counter!("courier_route_messages_failed", "route" => self.name.clone())
                            .increment(1);
                        warn!(
                            route = %self.name,
                            message_id = %message.id(),
                            error = %err,
                            "Message processing failed"
                        );
                    } else {
                        debug!(
                            route = %self.name,
                            message_id = %message.id(),
                            latency_us = response_latency.as_micros() as u64,
                            "Message processed"
                        );
                    }

                    // Submitter may have gone away; nothing to do then.
                    let _ = item.entry.ack_tx.send(outcome);
                    self.busy.store(false, Ordering::SeqCst);
                }
                Err(fault) => {
                    self.messages_processed.fetch_add(1, Ordering::SeqCst);
                    self.messages_failed.fetch_add(1, Ordering::SeqCst);
                    let _ = item.entry.ack_tx.send(StageOutcome::Failed(
                        courier_common::RoutingError::terminal(
                            self.name.as_str(),
                            fault.reason.clone(),
                        ),
                    ));
                    self.abort(fault);
                    self.busy.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if self.cancelled.load(Ordering::SeqCst) {
            // Clean cancel abandons undispatched items; their ack channels
            // close as the entries drop.
            let abandoned = {
                let mut heap = self.heap.lock();
                let n = heap.len();
                heap.clear();
                n
            };
            if abandoned > 0 {
                info!(route = %self.name, abandoned = abandoned, "Cancelled with queued items");
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        debug!(route = %self.name, instance_id = %self.instance_id, "Queue route loop exited");
    }

    fn abort(&self, fault: RouteFault) {
        self.aborted.store(true, Ordering::SeqCst);
        counter!("courier_route_aborts", "route" => self.name.clone()).increment(1);

        let pending: Vec<Arc<dyn Message>> = {
            let mut heap = self.heap.lock();
            heap.drain().map(|item| item.entry.message).collect()
        };

        error!(
            route = %self.name,
            instance_id = %self.instance_id,
            fault = %fault.reason,
            pending = pending.len(),
            "Worker aborted"
        );

        if let Some(listener) = &self.abort_listener {
            listener.on_process_stopped(RouteAbort {
                route: self.name.clone(),
                instance_id: self.instance_id,
                fault,
                pending,
            });
        }
    }

    /// Stop the loop after the current item completes. Queued items are
    /// abandoned.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    /// Cancel and wait for the loop to exit. Returns whether it exited
    /// inside the timeout.
    pub async fn cancel_timeout(&self, timeout: Duration) -> bool {
        self.cancel();
        let deadline = Instant::now() + timeout;
        while !self.stopped.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
        }
        true
    }

    /// Block until the queue is empty and nothing is in flight, or the
    /// timeout elapses. Returns `false` on timeout or if the worker
    /// aborted (queued work was lost, not completed).
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return false;
            }
            if self.queue_length() == 0 && !self.busy.load(Ordering::SeqCst) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn queue_length(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn message_requests(&self) -> u64 {
        self.message_requests.load(Ordering::SeqCst)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::SeqCst)
    }

    pub fn failure_rate(&self) -> f64 {
        let processed = self.messages_processed.load(Ordering::SeqCst);
        if processed == 0 {
            return 0.0;
        }
        self.messages_failed.load(Ordering::SeqCst) as f64 / processed as f64
    }

    /// Read-only health snapshot.
    pub fn state(&self) -> QueueState {
        let processed = self.messages_processed.load(Ordering::SeqCst);
        let divisor = processed.max(1);
        QueueState {
            instance_id: self.instance_id,
            route: self.name.clone(),
            busy: self.busy.load(Ordering::SeqCst),
            aborted: self.aborted.load(Ordering::SeqCst),
            queue_length: self.queue_length(),
            avg_request_latency_us: self.request_latency_total_us.load(Ordering::SeqCst) / divisor,
            avg_response_latency_us: self.response_latency_total_us.load(Ordering::SeqCst)
                / divisor,
            failure_rate: self.failure_rate(),
            messages_processed: processed,
            message_requests: self.message_requests.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl MessageRoute for PriorityQueueRoute {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, entry: RouteEntry) -> Result<(), SendError> {
        self.enqueue(entry)
    }
}
