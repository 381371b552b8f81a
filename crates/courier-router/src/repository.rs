//! Durable-store boundary for in-flight routing state.
//!
//! The engine does not persist anything itself; it acquires a scoped
//! transactional handle per request and releases it on the terminal
//! outcome. Persisted layout and serialization are owned by the
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use courier_common::Result;

use crate::config::RoutingConfiguration;

/// Scoped handle for one request's routing state.
#[async_trait]
pub trait RoutingRepository: Send + Sync {
    /// Persist the current routing state of the message.
    async fn save(&self, message_id: Uuid, config: &RoutingConfiguration) -> Result<()>;

    /// Release the scope on the message's terminal outcome.
    async fn release(&self, message_id: Uuid) -> Result<()>;
}

/// Opens one repository scope per request.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn open_scope(&self) -> Result<Arc<dyn RoutingRepository>>;
}

/// Default provider for deployments that keep routing state in memory only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRepositoryProvider;

struct NullRepository;

#[async_trait]
impl RoutingRepository for NullRepository {
    async fn save(&self, _message_id: Uuid, _config: &RoutingConfiguration) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _message_id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RepositoryProvider for NullRepositoryProvider {
    async fn open_scope(&self) -> Result<Arc<dyn RoutingRepository>> {
        Ok(Arc::new(NullRepository))
    }
}
