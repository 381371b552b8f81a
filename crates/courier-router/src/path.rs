//! Ordered, deduplicated sequence of routes a profile requires.

use std::sync::Arc;

use courier_queue::MessageRoute;

/// Immutable stage sequence. Duplicate route names are dropped, keeping
/// the first occurrence.
#[derive(Clone)]
pub struct ServiceRoutingPath {
    routes: Vec<Arc<dyn MessageRoute>>,
}

impl ServiceRoutingPath {
    pub fn new(routes: Vec<Arc<dyn MessageRoute>>) -> Self {
        let mut seen: Vec<String> = Vec::with_capacity(routes.len());
        let mut deduped = Vec::with_capacity(routes.len());
        for route in routes {
            if seen.iter().any(|n| n == route.name()) {
                continue;
            }
            seen.push(route.name().to_string());
            deduped.push(route);
        }
        Self { routes: deduped }
    }

    pub fn first(&self) -> Option<Arc<dyn MessageRoute>> {
        self.routes.first().cloned()
    }

    pub fn contains(&self, route_name: &str) -> bool {
        self.routes.iter().any(|r| r.name() == route_name)
    }

    pub fn find(&self, route_name: &str) -> Option<Arc<dyn MessageRoute>> {
        self.routes
            .iter()
            .find(|r| r.name() == route_name)
            .cloned()
    }

    /// The stage following the named one, or `None` when the named stage is
    /// the last (or not a member).
    pub fn next_after(&self, route_name: &str) -> Option<Arc<dyn MessageRoute>> {
        let index = self.routes.iter().position(|r| r.name() == route_name)?;
        self.routes.get(index + 1).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn route_names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name().to_string()).collect()
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
    fn deduplicates_preserving_order() {
        let path =
            ServiceRoutingPath::new(vec![route("a"), route("b"), route("a"), route("c")]);
        assert_eq!(path.route_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn next_after_walks_the_sequence() {
        let path = ServiceRoutingPath::new(vec![route("a"), route("b"), route("c")]);
        assert_eq!(path.next_after("a").unwrap().name(), "b");
        assert_eq!(path.next_after("b").unwrap().name(), "c");
        assert!(path.next_after("c").is_none());
        assert!(path.next_after("missing").is_none());
    }

    #[test]
    fn membership_queries() {
        let path = ServiceRoutingPath::new(vec![route("a")]);
        assert!(path.contains("a"));
        assert!(!path.contains("b"));
        assert_eq!(path.first().unwrap().name(), "a");
    }
}
