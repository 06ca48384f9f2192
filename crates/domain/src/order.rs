//! Orders owned by the order service.
//!
//! An order is written locally when a saga starts and finalized exactly once
//! when the saga's outcome is known. It is never a compensable branch.

use chrono::{DateTime, Utc};
use common::{Amount, OrderId, Xid};
use serde::{Deserialize, Serialize};
use tx_store::{BranchStore, Row};

use crate::{DomainError, Result};

/// The status of an order.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Committed
///           └──► RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// The saga that created the order has not finished.
    #[default]
    Pending,

    /// Every branch of the saga committed (terminal state).
    Committed,

    /// The saga rolled back (terminal state).
    RolledBack,
}

impl OrderStatus {
    /// Returns true if the order can move to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Committed)
                | (OrderStatus::Pending, OrderStatus::RolledBack)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Committed => "Committed",
            OrderStatus::RolledBack => "RolledBack",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for placing an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub user_id: String,
    pub product_id: String,
    pub count: i64,
    pub money: Amount,
}

impl NewOrder {
    /// Largest count whose stock deduction still fits in an [`Amount`].
    pub const MAX_COUNT: i64 = Amount::MAX_UNITS;

    pub fn new(
        user_id: impl Into<String>,
        product_id: impl Into<String>,
        count: i64,
        money: Amount,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            product_id: product_id.into(),
            count,
            money,
        }
    }

    /// Rejects malformed input before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(DomainError::validation("userId must not be empty"));
        }
        if self.product_id.trim().is_empty() {
            return Err(DomainError::validation("productId must not be empty"));
        }
        if self.count <= 0 {
            return Err(DomainError::validation(format!(
                "count must be positive, got {}",
                self.count
            )));
        }
        if self.count > Self::MAX_COUNT {
            return Err(DomainError::validation(format!(
                "count must be at most {}, got {}",
                Self::MAX_COUNT,
                self.count
            )));
        }
        if !self.money.is_positive() {
            return Err(DomainError::validation(format!(
                "money must be positive, got {}",
                self.money
            )));
        }
        Ok(())
    }
}

/// An order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: String,
    pub product_id: String,
    pub count: i64,
    pub money: Amount,
    pub status: OrderStatus,
    /// The global transaction that created the order.
    pub xid: Option<Xid>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order.
    pub fn pending(new: NewOrder, xid: Option<Xid>) -> Self {
        Self {
            id: OrderId::new(),
            user_id: new.user_id,
            product_id: new.product_id,
            count: new.count,
            money: new.money,
            status: OrderStatus::Pending,
            xid,
            created_at: Utc::now(),
        }
    }

    /// Returns the order with its status moved to `next`.
    ///
    /// Moving to the status the order already has is a no-op.
    pub fn transition(&self, next: OrderStatus) -> Result<Self> {
        if self.status == next {
            return Ok(self.clone());
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        Ok(Self {
            status: next,
            ..self.clone()
        })
    }
}

impl Row for Order {
    fn kind() -> &'static str {
        "order"
    }

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Creates and finalizes orders in a row store.
pub struct OrderService<S> {
    store: S,
}

impl<S: BranchStore<Order>> OrderService<S> {
    /// Creates a new order service.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes a new pending order.
    #[tracing::instrument(skip(self, new), fields(user_id = %new.user_id, product_id = %new.product_id))]
    pub async fn create(&self, new: NewOrder, xid: Option<Xid>) -> Result<Order> {
        new.validate()?;
        let order = Order::pending(new, xid);
        self.store.insert(order.clone()).await?;

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order.id, "order created");
        Ok(order)
    }

    /// Marks an order committed.
    pub async fn mark_committed(&self, id: OrderId) -> Result<Order> {
        self.finalize(id, OrderStatus::Committed).await
    }

    /// Marks an order rolled back.
    pub async fn mark_rolled_back(&self, id: OrderId) -> Result<Order> {
        self.finalize(id, OrderStatus::RolledBack).await
    }

    /// Loads an order.
    pub async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.store.get(&id.to_string()).await?)
    }

    /// Loads the order created by the global transaction `xid`.
    pub async fn find_by_xid(&self, xid: &Xid) -> Result<Option<Order>> {
        let mut orders = self.store.find_by("xid", xid.as_str()).await?;
        Ok(orders.pop())
    }

    /// Finalizes the order created by `xid` if it is still pending.
    ///
    /// Returns `None` when no order belongs to the transaction. A terminal
    /// order is returned unchanged.
    pub async fn settle(&self, xid: &Xid, status: OrderStatus) -> Result<Option<Order>> {
        match self.find_by_xid(xid).await? {
            Some(order) if order.status == OrderStatus::Pending => {
                self.finalize(order.id, status).await.map(Some)
            }
            other => Ok(other),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn finalize(&self, id: OrderId, status: OrderStatus) -> Result<Order> {
        let order = self
            .store
            .mutate(&id.to_string(), None, |order: &Order| order.transition(status))
            .await
            .map_err(DomainError::from)?;

        metrics::counter!("orders_finalized_total", "status" => status.as_str()).increment(1);
        tracing::info!(order_id = %id, %status, "order finalized");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tx_store::InMemoryBranchStore;

    fn new_order() -> NewOrder {
        NewOrder::new("1", "1", 2, Amount::from_units(100))
    }

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn test_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Committed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::RolledBack));
        assert!(!OrderStatus::Committed.can_transition_to(OrderStatus::RolledBack));
        assert!(!OrderStatus::RolledBack.can_transition_to(OrderStatus::Committed));
        assert!(!OrderStatus::Committed.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn test_display() {
        assert_eq!(OrderStatus::RolledBack.to_string(), "RolledBack");
        assert_eq!(OrderStatus::Committed.to_string(), "Committed");
    }

    #[test]
    fn test_transition_is_once_only() {
        let order = Order::pending(new_order(), None);
        let committed = order.transition(OrderStatus::Committed).unwrap();
        assert_eq!(committed.status, OrderStatus::Committed);
        assert_eq!(
            committed.transition(OrderStatus::Committed).unwrap().status,
            OrderStatus::Committed
        );
        assert!(matches!(
            committed.transition(OrderStatus::RolledBack),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_validation() {
        assert!(new_order().validate().is_ok());
        assert!(NewOrder::new("", "1", 1, Amount::from_units(1)).validate().is_err());
        assert!(NewOrder::new("1", " ", 1, Amount::from_units(1)).validate().is_err());
        assert!(NewOrder::new("1", "1", 0, Amount::from_units(1)).validate().is_err());
        assert!(NewOrder::new("1", "1", 1, Amount::zero()).validate().is_err());
    }

    #[test]
    fn test_validation_rejects_count_past_amount_range() {
        let max = NewOrder::new("1", "1", NewOrder::MAX_COUNT, Amount::from_units(1));
        assert!(max.validate().is_ok());

        let err = NewOrder::new("1", "1", NewOrder::MAX_COUNT + 1, Amount::from_units(1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(
            NewOrder::new("1", "1", i64::MAX, Amount::from_units(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_order_serializes_camel_case() {
        let order = Order::pending(new_order(), Some(Xid::generate()));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["money"], "100.00");
        assert!(json.get("productId").is_some());
    }

    #[tokio::test]
    async fn test_service_create_and_finalize() {
        let service = OrderService::new(InMemoryBranchStore::new());
        let xid = Xid::generate();

        let order = service.create(new_order(), Some(xid.clone())).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.xid, Some(xid));

        service.mark_rolled_back(order.id).await.unwrap();
        let stored = service.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::RolledBack);

        let err = service.mark_committed(order.id).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_service_settles_pending_order_by_xid() {
        let service = OrderService::new(InMemoryBranchStore::new());
        let xid = Xid::generate();
        let order = service.create(new_order(), Some(xid.clone())).await.unwrap();
        service.create(new_order(), Some(Xid::generate())).await.unwrap();

        let found = service.find_by_xid(&xid).await.unwrap().unwrap();
        assert_eq!(found.id, order.id);

        let settled = service
            .settle(&xid, OrderStatus::RolledBack)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, OrderStatus::RolledBack);

        // A terminal order is left alone.
        let again = service
            .settle(&xid, OrderStatus::Committed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.status, OrderStatus::RolledBack);

        assert!(
            service
                .settle(&Xid::generate(), OrderStatus::Committed)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_service_unknown_order() {
        let service = OrderService::new(InMemoryBranchStore::new());
        let err = service.mark_committed(OrderId::new()).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { kind: "order", .. }));
    }

    #[tokio::test]
    async fn test_service_rejects_invalid_input() {
        let service = OrderService::new(InMemoryBranchStore::new());
        let err = service
            .create(NewOrder::new("1", "1", -1, Amount::from_units(1)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
