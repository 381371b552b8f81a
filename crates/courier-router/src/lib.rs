//! Courier message router
//!
//! Top-level orchestration for the routing engine:
//! - RoutingProfile / ProfileProvider: first-match profile resolution
//! - ServiceRoutingPath: ordered, deduplicated stage sequence
//! - RoutingConfiguration: per-request routing state
//! - Retry policies: per-message retry/failure-route decisions
//! - MessageRouter: drives each message through its resolved path

pub mod audit;
pub mod config;
pub mod path;
pub mod profile;
pub mod repository;
pub mod retry;
pub mod router;

pub use audit::{ActionEvent, ActionEventProxy, RoutingAction, TracingActionEventProxy};
pub use config::RoutingConfiguration;
pub use path::ServiceRoutingPath;
pub use profile::{
    DuplicateComparer, IdentityDuplicateComparer, ProfileProvider, RoutingProfile,
    StaticRoutingProfile,
};
pub use repository::{NullRepositoryProvider, RepositoryProvider, RoutingRepository};
pub use retry::{LimitedWindowRetryPolicy, RetryDecision, RetryPolicy, ZeroRetryPolicy};
pub use router::MessageRouter;

pub use courier_common::{CourierError, Result};
