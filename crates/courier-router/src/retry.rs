//! Retry / failure policies.
//!
//! Decide the fate of a message after a stage reports a recoverable
//! failure: re-enter the same stage after a delay, or divert to the
//! profile's failure route. Policy state is keyed per message identity so
//! repeated failures of one message are counted independently of others.

use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::RoutingConfiguration;

/// Verdict of a retry policy for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn divert() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

pub trait RetryPolicy: Send + Sync {
    /// Called after a recoverable stage failure. `retry: true` re-enters
    /// the stage that failed after `delay`; `retry: false` diverts to the
    /// failure route.
    fn should_retry(&self, message_id: Uuid, config: &RoutingConfiguration) -> RetryDecision;

    /// Called on the message's terminal outcome so per-message state can be
    /// discarded.
    fn reset(&self, message_id: Uuid) {
        let _ = message_id;
    }
}

/// Never retries; every failure routes immediately to the failure route.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroRetryPolicy;

impl RetryPolicy for ZeroRetryPolicy {
    fn should_retry(&self, _message_id: Uuid, _config: &RoutingConfiguration) -> RetryDecision {
        RetryDecision::divert()
    }
}

/// Retries up to `max_attempts - 1` times at the route that failed, waiting
/// `window` between attempts; after the limit is exhausted the message is
/// diverted to the failure route exactly once.
pub struct LimitedWindowRetryPolicy {
    max_attempts: u32,
    window: Duration,
    failures: DashMap<Uuid, u32>,
}

impl LimitedWindowRetryPolicy {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            failures: DashMap::new(),
        }
    }
}

impl RetryPolicy for LimitedWindowRetryPolicy {
    fn should_retry(&self, message_id: Uuid, _config: &RoutingConfiguration) -> RetryDecision {
        let failures = {
            let mut entry = self.failures.entry(message_id).or_insert(0);
            *entry += 1;
            *entry
        };

        if failures < self.max_attempts {
            debug!(
                message_id = %message_id,
                failures = failures,
                max_attempts = self.max_attempts,
                "Retrying at the same route"
            );
            RetryDecision::retry_after(self.window)
        } else {
            debug!(
                message_id = %message_id,
                failures = failures,
                "Attempts exhausted, diverting to failure route"
            );
            RetryDecision::divert()
        }
    }

    fn reset(&self, message_id: Uuid) {
        self.failures.remove(&message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfiguration;
    use crate::path::ServiceRoutingPath;
    use async_trait::async_trait;
    use courier_common::{RouteEntry, SendError};
    use courier_queue::MessageRoute;
    use std::sync::Arc;

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

    fn config() -> RoutingConfiguration {
        let a: Arc<dyn MessageRoute> = Arc::new(NamedRoute("a".to_string()));
        let failure: Arc<dyn MessageRoute> = Arc::new(NamedRoute("failure".to_string()));
        RoutingConfiguration::new(
            "profile",
            ServiceRoutingPath::new(vec![a.clone()]),
            a,
            failure,
        )
    }

    #[test]
    fn zero_retry_always_diverts() {
        let policy = ZeroRetryPolicy;
        let cfg = config();
        let decision = policy.should_retry(Uuid::new_v4(), &cfg);
        assert!(!decision.retry);
    }

    #[test]
    fn limited_window_retries_then_diverts_exactly_once() {
        let policy = LimitedWindowRetryPolicy::new(3, Duration::from_millis(50));
        let cfg = config();
        let id = Uuid::new_v4();

        // Two retries at the same route, then divert, then keep diverting.
        let first = policy.should_retry(id, &cfg);
        assert!(first.retry);
        assert_eq!(first.delay, Duration::from_millis(50));
        assert!(policy.should_retry(id, &cfg).retry);
        assert!(!policy.should_retry(id, &cfg).retry);
        assert!(!policy.should_retry(id, &cfg).retry);
    }

    #[test]
    fn failure_counts_are_per_message() {
        let policy = LimitedWindowRetryPolicy::new(2, Duration::from_millis(10));
        let cfg = config();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(policy.should_retry(first, &cfg).retry);
        assert!(!policy.should_retry(first, &cfg).retry);
        // An exhausted sibling does not affect a fresh message.
        assert!(policy.should_retry(second, &cfg).retry);
    }

    #[test]
    fn reset_clears_per_message_state() {
        let policy = LimitedWindowRetryPolicy::new(2, Duration::from_millis(10));
        let cfg = config();
        let id = Uuid::new_v4();

        assert!(policy.should_retry(id, &cfg).retry);
        assert!(!policy.should_retry(id, &cfg).retry);
        policy.reset(id);
        assert!(policy.should_retry(id, &cfg).retry);
    }
}
