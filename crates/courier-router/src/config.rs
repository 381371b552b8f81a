//! Per-request routing state.

use std::sync::Arc;

use courier_queue::MessageRoute;

use crate::path::ServiceRoutingPath;

/// Mutable routing state for one request. Created once per request, owned
/// exclusively by the router's driver task, discarded on the terminal
/// outcome. The current route is always a member of the resolved path or
/// the failure route.
pub struct RoutingConfiguration {
    profile: String,
    path: ServiceRoutingPath,
    current_route: Arc<dyn MessageRoute>,
    failure_route: Arc<dyn MessageRoute>,
    on_failure_route: bool,
    /// Logical delivery attempts at the current route, including the first.
    attempts: u32,
    /// Total retries across the whole path. Distinct from any queue-level
    /// request counter.
    retry_count: u32,
}

impl RoutingConfiguration {
    pub fn new(
        profile: impl Into<String>,
        path: ServiceRoutingPath,
        entry_route: Arc<dyn MessageRoute>,
        failure_route: Arc<dyn MessageRoute>,
    ) -> Self {
        Self {
            profile: profile.into(),
            path,
            current_route: entry_route,
            failure_route,
            on_failure_route: false,
            attempts: 0,
            retry_count: 0,
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn path(&self) -> &ServiceRoutingPath {
        &self.path
    }

    pub fn current_route(&self) -> Arc<dyn MessageRoute> {
        self.current_route.clone()
    }

    pub fn failure_route(&self) -> Arc<dyn MessageRoute> {
        self.failure_route.clone()
    }

    pub fn on_failure_route(&self) -> bool {
        self.on_failure_route
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Record one dispatch into the current route.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Record a retry decision: the message re-enters the same route.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Advance to the next stage of the path after a successful stage.
    /// Resets the per-route attempt counter.
    pub fn advance_to(&mut self, next: Arc<dyn MessageRoute>) {
        debug_assert!(self.path.contains(next.name()));
        self.current_route = next;
        self.attempts = 0;
    }

    /// Divert to the failure route. Terminal stage when reached.
    pub fn divert_to_failure(&mut self) {
        self.current_route = self.failure_route.clone();
        self.on_failure_route = true;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_common::{RouteEntry, SendError};

    struct NamedRoute(String);

    #[async_trait]
    impl MessageRoute for NamedRoute {
        fn name(&self) -> &str {
            &self.0
        }

        async fn send_message(&self, _entry: RouteEntry) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn route(name: &str) -> Arc<dyn MessageRoute> {
        Arc::new(NamedRoute(name.to_string()))
    }

    #[test]
    fn advance_resets_attempts_but_not_retry_count() {
        let a = route("a");
        let b = route("b");
        let mut cfg = RoutingConfiguration::new(
            "p",
            ServiceRoutingPath::new(vec![a.clone(), b.clone()]),
            a,
            route("failure"),
        );

        cfg.record_attempt();
        cfg.record_retry();
        cfg.record_attempt();
        assert_eq!(cfg.attempts(), 2);

        cfg.advance_to(b);
        assert_eq!(cfg.attempts(), 0);
        assert_eq!(cfg.retry_count(), 1);
        assert_eq!(cfg.current_route().name(), "b");
    }

    #[test]
    fn divert_marks_failure_route_terminal() {
        let a = route("a");
        let mut cfg = RoutingConfiguration::new(
            "p",
            ServiceRoutingPath::new(vec![a.clone()]),
            a,
            route("failure"),
        );

        assert!(!cfg.on_failure_route());
        cfg.divert_to_failure();
        assert!(cfg.on_failure_route());
        assert_eq!(cfg.current_route().name(), "failure");
    }
}
