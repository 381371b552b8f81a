//! Routing profiles and first-match profile resolution.

use std::sync::Arc;

use tracing::debug;

use courier_common::{CourierError, Message, Result};
use courier_queue::MessageRoute;

use crate::path::ServiceRoutingPath;
use crate::retry::RetryPolicy;

/// A predicate plus path: decides whether and how a message is routed.
pub trait RoutingProfile: Send + Sync {
    fn name(&self) -> &str;
    fn matches_profile(&self, message: &dyn Message) -> bool;
    fn route_path(&self) -> &ServiceRoutingPath;
    fn failure_route(&self) -> Arc<dyn MessageRoute>;
    fn retry_policy(&self) -> Arc<dyn RetryPolicy>;
}

/// Profile with a fixed predicate closure. Covers most configurations
/// without a bespoke trait impl.
pub struct StaticRoutingProfile {
    name: String,
    predicate: Box<dyn Fn(&dyn Message) -> bool + Send + Sync>,
    path: ServiceRoutingPath,
    failure_route: Arc<dyn MessageRoute>,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl StaticRoutingProfile {
    pub fn new(
        name: impl Into<String>,
        path: ServiceRoutingPath,
        failure_route: Arc<dyn MessageRoute>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(|_| true),
            path,
            failure_route,
            retry_policy,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&dyn Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Box::new(predicate);
        self
    }
}

impl RoutingProfile for StaticRoutingProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches_profile(&self, message: &dyn Message) -> bool {
        (self.predicate)(message)
    }

    fn route_path(&self) -> &ServiceRoutingPath {
        &self.path
    }

    fn failure_route(&self) -> Arc<dyn MessageRoute> {
        self.failure_route.clone()
    }

    fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.retry_policy.clone()
    }
}

/// Produces the key used to recognize duplicate in-flight submissions of
/// logically identical messages.
pub trait DuplicateComparer: Send + Sync {
    fn duplicate_key(&self, message: &dyn Message) -> String;
}

/// Default duplicate recognition: message identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDuplicateComparer;

impl DuplicateComparer for IdentityDuplicateComparer {
    fn duplicate_key(&self, message: &dyn Message) -> String {
        message.id().to_string()
    }
}

/// Registration-ordered profile set with first-match resolution.
pub struct ProfileProvider {
    profiles: Vec<Arc<dyn RoutingProfile>>,
    duplicate_comparer: Arc<dyn DuplicateComparer>,
}

impl ProfileProvider {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            duplicate_comparer: Arc::new(IdentityDuplicateComparer),
        }
    }

    pub fn register(mut self, profile: Arc<dyn RoutingProfile>) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn with_duplicate_comparer(mut self, comparer: Arc<dyn DuplicateComparer>) -> Self {
        self.duplicate_comparer = comparer;
        self
    }

    pub fn duplicate_comparer(&self) -> Arc<dyn DuplicateComparer> {
        self.duplicate_comparer.clone()
    }

    /// Profiles are consulted in registration order; the first whose
    /// predicate accepts the message wins.
    pub fn resolve(&self, message: &dyn Message) -> Result<Arc<dyn RoutingProfile>> {
        for profile in &self.profiles {
            if profile.matches_profile(message) {
                debug!(
                    message_id = %message.id(),
                    profile = %profile.name(),
                    "Profile resolved"
                );
                return Ok(profile.clone());
            }
        }
        Err(CourierError::NoMatchingProfile(message.id()))
    }
}

impl Default for ProfileProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ZeroRetryPolicy;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use courier_common::{BasicMessage, RouteEntry, SendError};

    struct NamedRoute(String);

    #[async_trait]
    impl MessageRoute for NamedRoute {
        fn name(&self) -> &str {
            &self.0
        }

        async fn send_message(&self, _entry: RouteEntry) -> std::result::Result<(), SendError> {
            Ok(())
        }
    }

    fn route(name: &str) -> Arc<dyn MessageRoute> {
        Arc::new(NamedRoute(name.to_string()))
    }

    fn profile(name: &str, urgent_only: bool) -> Arc<dyn RoutingProfile> {
        let p = StaticRoutingProfile::new(
            name,
            ServiceRoutingPath::new(vec![route("a")]),
            route("failure"),
            Arc::new(ZeroRetryPolicy),
        );
        let p = if urgent_only {
            p.with_predicate(|m| m.escalation_threshold() > ChronoDuration::seconds(30))
        } else {
            p
        };
        Arc::new(p)
    }

    fn message(escalation_secs: i64) -> BasicMessage {
        BasicMessage::new(
            Utc::now() + ChronoDuration::minutes(5),
            ChronoDuration::seconds(escalation_secs),
        )
    }

    #[test]
    fn first_matching_profile_wins_in_registration_order() {
        let provider = ProfileProvider::new()
            .register(profile("urgent", true))
            .register(profile("catch-all", false));

        let urgent = message(60);
        let normal = message(5);
        assert_eq!(provider.resolve(&urgent).unwrap().name(), "urgent");
        assert_eq!(provider.resolve(&normal).unwrap().name(), "catch-all");
    }

    #[test]
    fn no_match_is_a_provider_error() {
        let provider = ProfileProvider::new().register(profile("urgent", true));
        let normal = message(5);
        assert!(matches!(
            provider.resolve(&normal),
            Err(CourierError::NoMatchingProfile(_))
        ));
    }

    #[test]
    fn identity_comparer_keys_by_message_id() {
        let comparer = IdentityDuplicateComparer;
        let m = message(5);
        assert_eq!(comparer.duplicate_key(&m), m.id.to_string());
    }
}
