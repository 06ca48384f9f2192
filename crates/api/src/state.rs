//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{Order, OrderService, Resource};
use saga::{BranchError, BranchParticipant, PlaceOrder, ResourceManager, TransactionCoordinator};
use tx_store::{BranchStore, TransactionLog};

/// Row-level access to a local participant, independent of its row type.
#[async_trait]
pub trait ResourceRows: Send + Sync {
    async fn row(&self, id: &str) -> Result<Option<serde_json::Value>, BranchError>;

    /// Drops rollback fences older than `retention`.
    async fn purge_expired_fences(&self, retention: Duration) -> Result<usize, BranchError>;
}

#[async_trait]
impl<R, S> ResourceRows for ResourceManager<R, S>
where
    R: Resource,
    S: BranchStore<R>,
{
    async fn row(&self, id: &str) -> Result<Option<serde_json::Value>, BranchError> {
        let Some(row) = self.get(id).await? else {
            return Ok(None);
        };
        serde_json::to_value(row)
            .map(Some)
            .map_err(|e| BranchError::internal(e.to_string()))
    }

    async fn purge_expired_fences(&self, retention: Duration) -> Result<usize, BranchError> {
        ResourceManager::purge_expired_fences(self, retention).await
    }
}

/// A resource manager served by this process.
#[derive(Clone)]
pub struct LocalResource {
    pub participant: Arc<dyn BranchParticipant>,
    pub rows: Arc<dyn ResourceRows>,
}

impl LocalResource {
    pub fn new<R, S>(manager: ResourceManager<R, S>) -> Self
    where
        R: Resource + 'static,
        S: BranchStore<R> + 'static,
    {
        let manager = Arc::new(manager);
        Self {
            participant: manager.clone(),
            rows: manager,
        }
    }
}

/// Shared application state accessible from all handlers.
pub struct AppState<L, S> {
    pub storage: LocalResource,
    pub account: LocalResource,
    pub orders: Arc<OrderService<S>>,
    pub place_order: PlaceOrder<L, S>,
}

impl<L, S> AppState<L, S>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    pub fn coordinator(&self) -> &TransactionCoordinator<L> {
        self.place_order.coordinator()
    }
}
