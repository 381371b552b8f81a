//! Courier priority queuing engine
//!
//! This crate provides the worker-queue layer of the router:
//! - PriorityQueueRoute: single-consumer worker draining a priority queue
//! - PriorityQueuePool: elastic collection of workers behind one route
//! - Queuing policies: admission control for worker creation
//! - Availability comparers: deterministic ranking of queues and components

pub mod compare;
pub mod policy;
pub mod pool;
pub mod route;
pub mod state;

pub use compare::{
    ComponentAvailabilityComparer, QueueAvailabilityComparer, ResourceWeighted, WeightStrategy,
};
pub use policy::{
    LimitedResourceQueuingPolicy, PerformanceMonitor, QueuingPolicy, StaticQueuingPolicy,
};
pub use pool::{PriorityQueuePool, RouteFactory};
pub use route::{
    AbortListener, DeadlineComparer, MessageProcessor, MessageRoute, PriorityComparer,
    PriorityQueueRoute, RouteAbort,
};
pub use state::{PoolState, QueueState};
