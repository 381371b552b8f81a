//! MessageRouter - top-level orchestrator.
//!
//! Accepts inbound requests, resolves a routing profile, and drives each
//! message through its resolved path one stage at a time. Stage failures go
//! through the profile's retry policy; exhaustion diverts to the failure
//! route. Every accepted request yields exactly one terminal delivery
//! notification.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_common::{
    CourierError, Message, MessageRoutingRequest, Result, RoutingError, RoutingListener,
    StageOutcome,
};

use crate::audit::{ActionEvent, ActionEventProxy, RoutingAction, TracingActionEventProxy};
use crate::config::RoutingConfiguration;
use crate::profile::ProfileProvider;
use crate::repository::{NullRepositoryProvider, RepositoryProvider, RoutingRepository};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Orchestrates message routing across profiles and routes.
pub struct MessageRouter {
    provider: Arc<ProfileProvider>,
    repository_provider: Arc<dyn RepositoryProvider>,
    audit: Arc<dyn ActionEventProxy>,

    /// Duplicate-key -> message id for every request currently in flight.
    in_flight: Arc<DashMap<String, Uuid>>,

    evaluations: Arc<AtomicU64>,
    deliveries: Arc<AtomicU64>,
    running: AtomicBool,
}

impl MessageRouter {
    pub fn new(provider: Arc<ProfileProvider>) -> Self {
        Self {
            provider,
            repository_provider: Arc::new(NullRepositoryProvider),
            audit: Arc::new(TracingActionEventProxy),
            in_flight: Arc::new(DashMap::new()),
            evaluations: Arc::new(AtomicU64::new(0)),
            deliveries: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(true),
        }
    }

    pub fn with_repository(mut self, provider: Arc<dyn RepositoryProvider>) -> Self {
        self.repository_provider = provider;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn ActionEventProxy>) -> Self {
        self.audit = audit;
        self
    }

    /// Accept a routing request. Resolution and duplicate suppression run
    /// synchronously; dispatch and any retry backoff run on a spawned
    /// driver task so one message's delay never stalls another's routing.
    pub async fn send(&self, request: MessageRoutingRequest) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(CourierError::ShutdownInProgress);
        }

        let message = request.message.clone();
        let message_id = message.id();

        if message.deadline() < message.request_time() {
            return Err(CourierError::Validation(format!(
                "message {message_id} has a deadline before its request time"
            )));
        }

        // Duplicate suppression happens before evaluation.
        let dup_key = self.provider.duplicate_comparer().duplicate_key(&*message);
        match self.in_flight.entry(dup_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(message_id = %message_id, "Duplicate in-flight submission rejected");
                return Err(CourierError::DuplicateInFlight(message_id));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(message_id);
            }
        }

        match self.accept(request, &dup_key).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Nothing was queued; the key must not linger.
                self.in_flight.remove(&dup_key);
                Err(e)
            }
        }
    }

    async fn accept(&self, request: MessageRoutingRequest, dup_key: &str) -> Result<()> {
        let message = request.message;
        let listener = request.listener;
        let message_id = message.id();

        let profile = self.provider.resolve(&*message)?;
        let path = profile.route_path().clone();

        let entry_route = match &request.entry_route {
            Some(name) => path
                .find(name)
                .ok_or_else(|| CourierError::RouteNotResolvable(name.clone()))?,
            None => path.first().ok_or_else(|| {
                CourierError::Validation(format!(
                    "profile '{}' has an empty route path",
                    profile.name()
                ))
            })?,
        };

        let config = RoutingConfiguration::new(
            profile.name(),
            path,
            entry_route,
            profile.failure_route(),
        );

        let repository = self.repository_provider.open_scope().await?;

        self.evaluations.fetch_add(1, Ordering::SeqCst);
        counter!("courier_router_evaluations").increment(1);
        listener.on_evaluation(message_id, profile.name());
        self.audit
            .emit(ActionEvent::new(message_id, RoutingAction::Evaluated));

        let driver = RequestDriver {
            audit: self.audit.clone(),
            in_flight: self.in_flight.clone(),
            deliveries: self.deliveries.clone(),
        };
        let retry_policy = profile.retry_policy();
        let dup_key = dup_key.to_string();
        tokio::spawn(async move {
            driver
                .drive(message, listener, config, retry_policy, repository, dup_key)
                .await;
        });

        Ok(())
    }
}

/// Shared handles one spawned request task needs to finish a delivery.
struct RequestDriver {
    audit: Arc<dyn ActionEventProxy>,
    in_flight: Arc<DashMap<String, Uuid>>,
    deliveries: Arc<AtomicU64>,
}

impl RequestDriver {
    /// Strictly sequential stage traversal for one request. The message is
    /// never present in two stages at once.
    async fn drive(
        self,
        message: Arc<dyn Message>,
        listener: Arc<dyn RoutingListener>,
        mut config: RoutingConfiguration,
        retry_policy: Arc<dyn crate::retry::RetryPolicy>,
        repository: Arc<dyn RoutingRepository>,
        dup_key: String,
    ) {
        let message_id = message.id();
        let mut final_error: Option<RoutingError> = None;
        let mut diversion_error: Option<RoutingError> = None;

        loop {
            let current = config.current_route();
            let route_name = current.name().to_string();

            listener.on_routing(message_id, &route_name);
            self.audit.emit(
                ActionEvent::new(message_id, RoutingAction::StageEntered).with_route(&route_name),
            );
            config.record_attempt();

            let (entry, ack_rx) = courier_common::RouteEntry::new(message.clone());
            let outcome = match current.send_message(entry).await {
                Ok(()) => {
                    listener.on_received(message_id, &route_name);
                    match ack_rx.await {
                        Ok(outcome) => outcome,
                        // Worker aborted or was cancelled with this message
                        // still queued; the failure policy decides what
                        // happens next.
                        Err(_) => StageOutcome::Failed(RoutingError::new(
                            &route_name,
                            "stage abandoned the message before processing",
                        )),
                    }
                }
                Err(e) => StageOutcome::Failed(RoutingError::new(&route_name, e.to_string())),
            };

            if let Err(e) = repository.save(message_id, &config).await {
                warn!(message_id = %message_id, error = %e, "Failed to persist routing state");
            }

            match outcome {
                StageOutcome::Completed => {
                    listener.on_routed(message_id, &route_name);
                    listener.on_returned(message_id, &route_name);
                    self.audit.emit(
                        ActionEvent::new(message_id, RoutingAction::StageCompleted)
                            .with_route(&route_name),
                    );

                    // The failure route is always the terminal stage once
                    // reached; its success still delivers the error that
                    // caused the diversion.
                    if config.on_failure_route() {
                        final_error = diversion_error.take();
                        break;
                    }

                    match config.path().next_after(&route_name) {
                        Some(next) => config.advance_to(next),
                        None => break,
                    }
                }
                StageOutcome::Failed(err) => {
                    if config.on_failure_route() {
                        warn!(
                            message_id = %message_id,
                            route = %route_name,
                            error = %err,
                            "Failure route failed; delivering terminal routing error"
                        );
                        final_error = Some(err);
                        break;
                    }

                    let decision = retry_policy.should_retry(message_id, &config);
                    if decision.retry {
                        config.record_retry();
                        counter!("courier_router_retries").increment(1);
                        self.audit.emit(
                            ActionEvent::new(message_id, RoutingAction::Retried)
                                .with_route(&route_name)
                                .with_detail(err.to_string()),
                        );
                        debug!(
                            message_id = %message_id,
                            route = %route_name,
                            delay_ms = decision.delay.as_millis() as u64,
                            retry_count = config.retry_count(),
                            "Scheduling retry at the same route"
                        );
                        tokio::time::sleep(decision.delay).await;
                    } else {
                        self.audit.emit(
                            ActionEvent::new(message_id, RoutingAction::Diverted)
                                .with_route(&route_name)
                                .with_detail(err.to_string()),
                        );
                        diversion_error = Some(err);
                        config.divert_to_failure();
                    }
                }
            }
        }

        retry_policy.reset(message_id);
        if let Err(e) = repository.release(message_id).await {
            warn!(message_id = %message_id, error = %e, "Failed to release repository scope");
        }
        self.in_flight.remove(&dup_key);
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        counter!("courier_router_deliveries").increment(1);

        self.audit.emit(
            ActionEvent::new(message_id, RoutingAction::Delivered).with_detail(
                final_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "success".to_string()),
            ),
        );
        listener.on_delivered(message_id, final_error);
    }
}

impl MessageRouter {
    /// Requests accepted (evaluation notifications emitted).
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Terminal delivery notifications emitted. Eventually equals
    /// `evaluation_count` for every accepted request.
    pub fn delivery_count(&self) -> u64 {
        self.deliveries.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop accepting new requests and wait for in-flight ones to reach
    /// their terminal outcome. Returns whether everything drained inside
    /// the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("MessageRouter shutting down");
        self.running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        while !self.in_flight.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight.len(),
                    "Shutdown timeout with requests still in flight"
                );
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        info!("MessageRouter shutdown complete");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ServiceRoutingPath;
    use crate::profile::StaticRoutingProfile;
    use crate::retry::ZeroRetryPolicy;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use courier_common::{BasicMessage, RouteEntry, SendError};
    use courier_queue::MessageRoute;
    use std::sync::atomic::AtomicUsize;

    /// Route that answers the ack inline.
    struct DirectRoute {
        name: String,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageRoute for DirectRoute {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send_message(&self, entry: RouteEntry) -> std::result::Result<(), SendError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            let _ = entry.ack_tx.send(StageOutcome::Completed);
            Ok(())
        }
    }

    struct CountingListener {
        evaluated: AtomicUsize,
        delivered: AtomicUsize,
        last_error: parking_lot::Mutex<Option<RoutingError>>,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                evaluated: AtomicUsize::new(0),
                delivered: AtomicUsize::new(0),
                last_error: parking_lot::Mutex::new(None),
            })
        }
    }

    impl RoutingListener for CountingListener {
        fn on_evaluation(&self, _message_id: Uuid, _profile: &str) {
            self.evaluated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delivered(&self, _message_id: Uuid, error: Option<RoutingError>) {
            *self.last_error.lock() = error;
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn direct(name: &str) -> Arc<DirectRoute> {
        Arc::new(DirectRoute {
            name: name.to_string(),
            handled: AtomicUsize::new(0),
        })
    }

    fn router_over(routes: Vec<Arc<DirectRoute>>) -> Arc<MessageRouter> {
        let path = ServiceRoutingPath::new(
            routes
                .iter()
                .map(|r| r.clone() as Arc<dyn MessageRoute>)
                .collect(),
        );
        let provider = ProfileProvider::new().register(Arc::new(StaticRoutingProfile::new(
            "default",
            path,
            direct("failure") as Arc<dyn MessageRoute>,
            Arc::new(ZeroRetryPolicy),
        )));
        Arc::new(MessageRouter::new(Arc::new(provider)))
    }

    fn message() -> Arc<dyn Message> {
        Arc::new(BasicMessage::new(
            Utc::now() + ChronoDuration::minutes(1),
            ChronoDuration::seconds(5),
        ))
    }

    async fn wait_for_deliveries(router: &MessageRouter, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while router.delivery_count() < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn delivers_through_every_stage() {
        let stages = vec![direct("a"), direct("b"), direct("c")];
        let router = router_over(stages.clone());
        let listener = CountingListener::new();

        router
            .send(MessageRoutingRequest::new(message(), listener.clone()))
            .await
            .unwrap();

        wait_for_deliveries(&router, 1).await;
        assert_eq!(listener.delivered.load(Ordering::SeqCst), 1);
        assert!(listener.last_error.lock().is_none());
        for stage in stages {
            assert_eq!(stage.handled.load(Ordering::SeqCst), 1);
        }
        assert_eq!(router.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_in_flight_submission_is_rejected() {
        // A never-completing route keeps the first submission in flight.
        struct StuckRoute;

        #[async_trait]
        impl MessageRoute for StuckRoute {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn send_message(&self, entry: RouteEntry) -> std::result::Result<(), SendError> {
                // Hold the ack sender forever.
                std::mem::forget(entry.ack_tx);
                Ok(())
            }
        }

        let path = ServiceRoutingPath::new(vec![Arc::new(StuckRoute) as Arc<dyn MessageRoute>]);
        let provider = ProfileProvider::new().register(Arc::new(StaticRoutingProfile::new(
            "default",
            path,
            direct("failure") as Arc<dyn MessageRoute>,
            Arc::new(ZeroRetryPolicy),
        )));
        let router = Arc::new(MessageRouter::new(Arc::new(provider)));
        let listener = CountingListener::new();

        let msg = message();
        router
            .send(MessageRoutingRequest::new(msg.clone(), listener.clone()))
            .await
            .unwrap();

        let result = router
            .send(MessageRoutingRequest::new(msg, listener.clone()))
            .await;
        assert!(matches!(result, Err(CourierError::DuplicateInFlight(_))));
    }

    #[tokio::test]
    async fn unmatched_message_fails_synchronously_with_nothing_queued() {
        let provider = ProfileProvider::new(); // no profiles registered
        let router = Arc::new(MessageRouter::new(Arc::new(provider)));
        let listener = CountingListener::new();

        let result = router
            .send(MessageRoutingRequest::new(message(), listener.clone()))
            .await;
        assert!(matches!(result, Err(CourierError::NoMatchingProfile(_))));
        assert_eq!(router.in_flight_count(), 0);
        assert_eq!(router.evaluation_count(), 0);
    }

    #[tokio::test]
    async fn entry_route_override_must_be_a_path_member() {
        let router = router_over(vec![direct("a"), direct("b")]);
        let listener = CountingListener::new();

        let result = router
            .send(
                MessageRoutingRequest::new(message(), listener.clone())
                    .with_entry_route("unknown"),
            )
            .await;
        assert!(matches!(result, Err(CourierError::RouteNotResolvable(_))));

        // A valid override skips the stages before it.
        let a = direct("a");
        let b = direct("b");
        let router = router_over(vec![a.clone(), b.clone()]);
        router
            .send(MessageRoutingRequest::new(message(), listener.clone()).with_entry_route("b"))
            .await
            .unwrap();
        wait_for_deliveries(&router, 1).await;
        assert_eq!(a.handled.load(Ordering::SeqCst), 0);
        assert_eq!(b.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let router = router_over(vec![direct("a")]);
        assert!(router.shutdown(Duration::from_secs(1)).await);

        let listener = CountingListener::new();
        let result = router
            .send(MessageRoutingRequest::new(message(), listener))
            .await;
        assert!(matches!(result, Err(CourierError::ShutdownInProgress)));
    }
}
