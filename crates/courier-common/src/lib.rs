use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ============================================================================
// Core Message Types
// ============================================================================

/// Capability contract for a unit of work flowing through the router.
///
/// Identity is immutable after creation; priority ordering is derived from
/// the deadline/escalation fields, never stored on the message itself.
pub trait Message: Send + Sync + fmt::Debug {
    /// Unique, immutable identity of this message.
    fn id(&self) -> Uuid;
    /// Wall-clock time the message was requested.
    fn request_time(&self) -> DateTime<Utc>;
    /// Hard deadline for processing.
    fn deadline(&self) -> DateTime<Utc>;
    /// Offset before the deadline after which the message counts as urgent.
    fn escalation_threshold(&self) -> ChronoDuration;
}

/// Plain message implementation used by callers that have no richer type.
#[derive(Debug, Clone)]
pub struct BasicMessage {
    pub id: Uuid,
    pub request_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub escalation_threshold: ChronoDuration,
}

impl BasicMessage {
    pub fn new(deadline: DateTime<Utc>, escalation_threshold: ChronoDuration) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_time: Utc::now(),
            deadline,
            escalation_threshold,
        }
    }
}

impl Message for BasicMessage {
    fn id(&self) -> Uuid {
        self.id
    }

    fn request_time(&self) -> DateTime<Utc> {
        self.request_time
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn escalation_threshold(&self) -> ChronoDuration {
        self.escalation_threshold
    }
}

// ============================================================================
// Stage Outcomes
// ============================================================================

/// Business-level failure of one processing attempt. The worker that
/// produced it remains healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingError {
    pub stage: String,
    pub reason: String,
    pub retryable: bool,
}

impl RoutingError {
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn terminal(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.reason)
    }
}

/// Tagged result of one processing attempt. Recoverable failures travel as
/// values; worker-fatal faults are a separate [`RouteFault`] and never
/// appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed(RoutingError),
}

/// Unhandled fault raised by a processing step. Fatal to the worker that
/// hit it; sibling workers are unaffected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("route fault: {reason}")]
pub struct RouteFault {
    pub reason: String,
}

impl RouteFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Route Entries
// ============================================================================

/// A message handed to a route for one processing attempt, bundled with the
/// oneshot the worker answers through. If the worker aborts before
/// processing, the sender is dropped and the submitter observes a closed
/// channel.
#[derive(Debug)]
pub struct RouteEntry {
    pub message: Arc<dyn Message>,
    pub enqueued_at: Instant,
    pub ack_tx: tokio::sync::oneshot::Sender<StageOutcome>,
}

impl RouteEntry {
    pub fn new(
        message: Arc<dyn Message>,
    ) -> (Self, tokio::sync::oneshot::Receiver<StageOutcome>) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        (
            Self {
                message,
                enqueued_at: Instant::now(),
                ack_tx,
            },
            ack_rx,
        )
    }
}

/// Synchronous rejection of a `send_message` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The target worker has aborted and accepts no further work.
    #[error("route '{route}' has aborted")]
    Aborted { route: String },

    /// The target refused the message for a stated reason (admission denied,
    /// shutdown in progress, every worker aborted).
    #[error("send rejected: {0}")]
    Rejected(String),
}

// ============================================================================
// Routing Requests & Notifications
// ============================================================================

/// One inbound delivery attempt: the message plus the sink that receives
/// its lifecycle notifications. Exactly one terminal `on_delivered` is
/// produced per accepted request.
pub struct MessageRoutingRequest {
    pub message: Arc<dyn Message>,
    pub listener: Arc<dyn RoutingListener>,
    /// Entry route override; when `None` the profile's first route is used.
    pub entry_route: Option<String>,
}

impl MessageRoutingRequest {
    pub fn new(message: Arc<dyn Message>, listener: Arc<dyn RoutingListener>) -> Self {
        Self {
            message,
            listener,
            entry_route: None,
        }
    }

    pub fn with_entry_route(mut self, route: impl Into<String>) -> Self {
        self.entry_route = Some(route.into());
        self
    }
}

/// Observer for per-request routing lifecycle. Callbacks are invoked
/// synchronously from the router's driver task and must not block
/// meaningfully.
pub trait RoutingListener: Send + Sync {
    /// The request was accepted and a routing profile resolved.
    fn on_evaluation(&self, message_id: Uuid, profile: &str) {
        let _ = (message_id, profile);
    }
    /// The message is about to be dispatched into a stage.
    fn on_routing(&self, message_id: Uuid, route: &str) {
        let _ = (message_id, route);
    }
    /// The stage accepted the message into its queue.
    fn on_received(&self, message_id: Uuid, route: &str) {
        let _ = (message_id, route);
    }
    /// The stage finished processing the message successfully.
    fn on_routed(&self, message_id: Uuid, route: &str) {
        let _ = (message_id, route);
    }
    /// The message left the stage and the router is resolving the next one.
    fn on_returned(&self, message_id: Uuid, route: &str) {
        let _ = (message_id, route);
    }
    /// Terminal outcome. `error` is `None` on success.
    fn on_delivered(&self, message_id: Uuid, error: Option<RoutingError>);
}

// ============================================================================
// Admission Control
// ============================================================================

/// Verdict of an admission-control policy. Immutable value; equality covers
/// both the verdict and its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: String,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Sizing settings for an elastic queue pool. The hard worker cap lives
/// here; minimum size and idle trimming are the queuing policy's concern
/// (`trim_target`), so there is exactly one owner for each knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_queue_count: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_queue_count: 8,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no routing profile matches message {0}")]
    NoMatchingProfile(Uuid),

    #[error("no route resolvable by name '{0}'")]
    RouteNotResolvable(String),

    #[error("message {0} is already in flight")]
    DuplicateInFlight(Uuid),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_decision_equality_covers_both_fields() {
        let a = PolicyDecision::allow("headroom");
        let b = PolicyDecision::allow("headroom");
        let c = PolicyDecision::allow("pool empty");
        let d = PolicyDecision::deny("headroom");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn basic_message_identity_is_stable() {
        let msg = BasicMessage::new(Utc::now() + ChronoDuration::minutes(5), ChronoDuration::minutes(1));
        let id = msg.id();
        assert_eq!(msg.id(), id);
        assert_ne!(id, Uuid::nil());
    }

    #[test]
    fn route_entry_reports_through_oneshot() {
        let msg: Arc<dyn Message> = Arc::new(BasicMessage::new(
            Utc::now() + ChronoDuration::minutes(1),
            ChronoDuration::seconds(10),
        ));
        let (entry, mut ack_rx) = RouteEntry::new(msg);
        entry.ack_tx.send(StageOutcome::Completed).unwrap();
        assert_eq!(ack_rx.try_recv().unwrap(), StageOutcome::Completed);
    }

    #[test]
    fn dropped_entry_closes_ack_channel() {
        let msg: Arc<dyn Message> = Arc::new(BasicMessage::new(
            Utc::now() + ChronoDuration::minutes(1),
            ChronoDuration::seconds(10),
        ));
        let (entry, mut ack_rx) = RouteEntry::new(msg);
        drop(entry);
        assert!(ack_rx.try_recv().is_err());
    }
}
