//! Service usage balancing
//!
//! Tracks per-service request histories and selects the next service to
//! call using least-recently-used semantics: a service with a just-finished
//! call is preferred over one mid-call, and older activity sorts first.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("service is not tracked by this balancer")]
    UnknownService,

    #[error("request {0} is not tracked for this service")]
    UnknownRequest(Uuid),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("balancer requires at least one service")]
    NoServices,
}

pub type Result<T> = std::result::Result<T, BalanceError>;

/// State of one in-flight call. Transitions only move forward:
/// Pending -> InProgress -> Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceRequestState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// One in-flight or completed call to a balanced service.
#[derive(Debug, Clone)]
pub struct ServiceRequestStatus {
    pub request_time: DateTime<Utc>,
    pub response_time: Option<DateTime<Utc>>,
    pub state: ServiceRequestState,
}

impl ServiceRequestStatus {
    fn in_progress() -> Self {
        Self {
            request_time: Utc::now(),
            response_time: None,
            state: ServiceRequestState::InProgress,
        }
    }

    fn complete(&mut self) -> Result<()> {
        match self.state {
            ServiceRequestState::InProgress => {
                self.state = ServiceRequestState::Completed;
                self.response_time = Some(Utc::now());
                Ok(())
            }
            other => Err(BalanceError::InvalidTransition(format!(
                "{other:?} -> Completed"
            ))),
        }
    }
}

/// All outstanding and completed calls to one service, with summaries of
/// the most recently transitioned entry.
#[derive(Debug, Clone, Default)]
pub struct ServiceRequestHistory {
    requests: HashMap<Uuid, ServiceRequestStatus>,
    last_request: Option<DateTime<Utc>>,
    last_response: Option<DateTime<Utc>>,
    last_state: ServiceRequestState,
}

impl ServiceRequestHistory {
    /// Aggregate state: the state of the most recently transitioned entry.
    /// Pending for a never-used service.
    pub fn request_state(&self) -> ServiceRequestState {
        self.last_state
    }

    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        self.last_request
    }

    pub fn last_response(&self) -> Option<DateTime<Utc>> {
        self.last_response
    }

    pub fn outstanding(&self) -> usize {
        self.requests
            .values()
            .filter(|s| s.state == ServiceRequestState::InProgress)
            .count()
    }

    fn record_sent(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        let status = ServiceRequestStatus::in_progress();
        self.last_request = Some(status.request_time);
        self.last_state = ServiceRequestState::InProgress;
        self.requests.insert(id, status);
        id
    }

    fn record_received(&mut self, request_id: Uuid) -> Result<()> {
        let status = self
            .requests
            .get_mut(&request_id)
            .ok_or(BalanceError::UnknownRequest(request_id))?;
        status.complete()?;
        self.last_response = status.response_time;
        self.last_state = ServiceRequestState::Completed;
        Ok(())
    }
}

/// Orders histories most-available first: aggregate state (Completed, then
/// Pending, then InProgress), then the relevant timestamp - `last_response`
/// for completed histories, `last_request` otherwise - oldest activity
/// first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceUsageComparer;

impl ServiceUsageComparer {
    fn rank(state: ServiceRequestState) -> u8 {
        match state {
            ServiceRequestState::Completed => 0,
            ServiceRequestState::Pending => 1,
            ServiceRequestState::InProgress => 2,
        }
    }

    fn relevant_timestamp(history: &ServiceRequestHistory) -> Option<DateTime<Utc>> {
        match history.request_state() {
            ServiceRequestState::Completed => history.last_response(),
            _ => history.last_request(),
        }
    }

    pub fn compare(&self, a: &ServiceRequestHistory, b: &ServiceRequestHistory) -> Ordering {
        Self::rank(a.request_state())
            .cmp(&Self::rank(b.request_state()))
            .then_with(|| {
                // None (never used) sorts before any timestamp.
                match (Self::relevant_timestamp(a), Self::relevant_timestamp(b)) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(ta), Some(tb)) => ta.cmp(&tb),
                }
            })
    }
}

/// Least-recently-used selection across a fixed, pre-enumerated set of
/// services.
pub struct ServiceBalancer<S> {
    services: Vec<S>,
    histories: Mutex<Vec<ServiceRequestHistory>>,
    comparer: ServiceUsageComparer,
}

impl<S: PartialEq + fmt::Debug> ServiceBalancer<S> {
    pub fn new(services: Vec<S>) -> Result<Self> {
        if services.is_empty() {
            return Err(BalanceError::NoServices);
        }
        let histories = services
            .iter()
            .map(|_| ServiceRequestHistory::default())
            .collect();
        Ok(Self {
            services,
            histories: Mutex::new(histories),
            comparer: ServiceUsageComparer,
        })
    }

    fn index_of(&self, service: &S) -> Result<usize> {
        self.services
            .iter()
            .position(|s| s == service)
            .ok_or(BalanceError::UnknownService)
    }

    /// Record a new in-progress call against the service. The returned
    /// correlation id is never nil.
    pub fn notify_request_sent(&self, service: &S) -> Result<Uuid> {
        let index = self.index_of(service)?;
        let id = self.histories.lock()[index].record_sent();
        debug!(service = ?service, request_id = %id, "Request sent");
        Ok(id)
    }

    /// Mark the identified call completed.
    pub fn notify_response_received(&self, service: &S, request_id: Uuid) -> Result<()> {
        let index = self.index_of(service)?;
        self.histories.lock()[index].record_received(request_id)?;
        debug!(service = ?service, request_id = %request_id, "Response received");
        Ok(())
    }

    /// Re-rank all tracked services and return the most available one.
    /// Ties fall back to registration order.
    pub fn next_service(&self) -> &S {
        let histories = self.histories.lock();
        let best = (0..self.services.len())
            .min_by(|&a, &b| self.comparer.compare(&histories[a], &histories[b]))
            .unwrap_or(0);
        &self.services[best]
    }

    /// Snapshot of one service's history.
    pub fn history(&self, service: &S) -> Result<ServiceRequestHistory> {
        let index = self.index_of(service)?;
        Ok(self.histories.lock()[index].clone())
    }
}
