//! Fire-and-forget action/audit event emission.
//!
//! One structured event per routing action. The engine treats proxy
//! failures as non-fatal; implementations must not block meaningfully.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoutingAction {
    Evaluated,
    StageEntered,
    StageCompleted,
    Retried,
    Diverted,
    Delivered,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    pub message_id: Uuid,
    pub action: RoutingAction,
    pub route: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl ActionEvent {
    pub fn new(message_id: Uuid, action: RoutingAction) -> Self {
        Self {
            message_id,
            action,
            route: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait ActionEventProxy: Send + Sync {
    fn emit(&self, event: ActionEvent);
}

/// Default proxy: structured log line per action.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActionEventProxy;

impl ActionEventProxy for TracingActionEventProxy {
    fn emit(&self, event: ActionEvent) {
        info!(
            message_id = %event.message_id,
            action = ?event.action,
            route = event.route.as_deref().unwrap_or("-"),
            detail = event.detail.as_deref().unwrap_or(""),
            "Routing action"
        );
    }
}
