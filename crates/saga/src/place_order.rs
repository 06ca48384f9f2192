//! The place-order saga.
//!
//! Steps:
//! 1. `decrease_stock` on the storage participant
//! 2. `decrease_balance` on the account participant
//!
//! The order row itself is written locally by the business service, as
//! `Pending` before the first branch and finalized once the saga ends.
//! Each saga runs on its own task, so a caller that stops waiting never
//! leaves the transaction half-finished.

use std::sync::Arc;

use common::{Amount, OrderId, Xid};
use domain::{NewOrder, Order, OrderService, OrderStatus};
use serde::Serialize;
use tracing::Instrument;
use tx_store::{BranchStore, TransactionLog};

use crate::coordinator::{RecoveryReport, TransactionCoordinator};
use crate::definition::{SagaDefinition, SagaStep};
use crate::error::{Result, SagaError};
use crate::participant::BranchOperation;
use crate::state::{Outcome, TransactionStatus};
use crate::transaction::GlobalTransaction;

/// Global transaction name.
pub const SAGA_NAME: &str = "demo-place-order";

/// Step names.
pub const STEP_DECREASE_STOCK: &str = "decrease_stock";
pub const STEP_DECREASE_BALANCE: &str = "decrease_balance";

/// Participant resource kinds.
pub const STORAGE: &str = "storage";
pub const ACCOUNT: &str = "account";

/// The place-order saga description.
pub fn definition() -> SagaDefinition<NewOrder> {
    SagaDefinition::new(SAGA_NAME)
        .step(
            SagaStep::new(STEP_DECREASE_STOCK, STORAGE, |order: &NewOrder| {
                // An out-of-range count becomes a zero amount, which the participant refuses.
                let amount = Amount::try_from_units(order.count).unwrap_or_else(Amount::zero);
                BranchOperation::decrease(order.product_id.clone(), amount)
            })
            .compensated_by("restore product stock from its before-image"),
        )
        .step(
            SagaStep::new(STEP_DECREASE_BALANCE, ACCOUNT, |order: &NewOrder| {
                BranchOperation::decrease(order.user_id.clone(), order.money)
            })
            .compensated_by("restore account balance from its before-image"),
        )
}

/// A successfully placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub xid: Xid,
}

/// Business service placing orders through the coordinator.
pub struct PlaceOrder<L, S> {
    coordinator: Arc<TransactionCoordinator<L>>,
    orders: Arc<OrderService<S>>,
    definition: Arc<SagaDefinition<NewOrder>>,
}

impl<L, S> Clone for PlaceOrder<L, S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            orders: self.orders.clone(),
            definition: self.definition.clone(),
        }
    }
}

impl<L, S> PlaceOrder<L, S>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    pub fn new(coordinator: Arc<TransactionCoordinator<L>>, orders: Arc<OrderService<S>>) -> Self {
        Self {
            coordinator,
            orders,
            definition: Arc::new(definition()),
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<L> {
        &self.coordinator
    }

    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    pub fn definition(&self) -> &SagaDefinition<NewOrder> {
        &self.definition
    }

    /// Places an order: decreases stock, then balance, then commits.
    ///
    /// Any failure rolls back every applied branch and returns the
    /// original reason.
    #[tracing::instrument(skip(self, input), fields(user_id = %input.user_id, product_id = %input.product_id))]
    pub async fn place(&self, input: NewOrder) -> Result<PlacedOrder> {
        self.spawn_run(input, false).await
    }

    /// Applies every branch, then fails on purpose so everything is rolled back.
    #[tracing::instrument(skip(self, input), fields(user_id = %input.user_id, product_id = %input.product_id))]
    pub async fn fail_after_branches(&self, input: NewOrder) -> Result<PlacedOrder> {
        self.spawn_run(input, true).await
    }

    /// Finishes every transaction left open, then settles the orders they created.
    ///
    /// Same caveat as [`TransactionCoordinator::recover`]: run it only while
    /// no saga is executing.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.coordinator.recover().await?;

        let outcomes = report
            .committed
            .iter()
            .map(|xid| (xid, OrderStatus::Committed))
            .chain(report.rolled_back.iter().map(|xid| (xid, OrderStatus::RolledBack)));
        for (xid, status) in outcomes {
            match self.orders.settle(xid, status).await {
                Ok(Some(order)) => {
                    tracing::info!(order_id = %order.id, %xid, status = %order.status, "order settled by recovery")
                }
                Ok(None) => tracing::debug!(%xid, "recovered transaction has no order"),
                Err(err) => tracing::error!(%xid, error = %err, "could not settle order"),
            }
        }
        Ok(report)
    }

    /// Runs the saga on a task of its own.
    ///
    /// Dropping the returned future only stops the wait; the saga still
    /// commits or rolls back and finalizes its order.
    async fn spawn_run(&self, input: NewOrder, abort: bool) -> Result<PlacedOrder> {
        let this = self.clone();
        let saga = async move { this.run(input, abort).await }.instrument(tracing::Span::current());
        tokio::spawn(saga)
            .await
            .map_err(|err| SagaError::TaskFailed(err.to_string()))?
    }

    async fn run(&self, input: NewOrder, abort: bool) -> Result<PlacedOrder> {
        input.validate()?;

        let mut gtx = self.coordinator.begin(self.definition.name()).await?;
        let xid = gtx.xid().clone();

        let order = match self.orders.create(input.clone(), Some(xid.clone())).await {
            Ok(order) => order,
            Err(err) => return Err(self.abandon(&mut gtx, err.into()).await),
        };

        let applied = match self
            .coordinator
            .execute_steps(&mut gtx, &self.definition, &input)
            .await
        {
            Ok(_) if abort => Err(SagaError::Aborted(
                "order placement aborted after all branches applied".to_string(),
            )),
            Ok(_) => self
                .orders
                .mark_committed(order.id)
                .await
                .map(|_| ())
                .map_err(SagaError::from),
            Err(err) => Err(err),
        };

        match applied {
            Ok(()) => {
                self.coordinator.finish(&mut gtx, Outcome::Success).await?;

                metrics::counter!("orders_placed_total", "outcome" => "committed").increment(1);
                tracing::info!(order_id = %order.id, %xid, "order placed");
                Ok(PlacedOrder {
                    order_id: order.id,
                    xid,
                })
            }
            Err(err) => {
                if let Err(mark) = self.orders.mark_rolled_back(order.id).await {
                    tracing::error!(order_id = %order.id, error = %mark, "could not mark order rolled back");
                }
                let err = self.abandon(&mut gtx, err).await;

                metrics::counter!("orders_placed_total", "outcome" => "rolled_back").increment(1);
                tracing::warn!(order_id = %order.id, %xid, code = %err.code(), error = %err, "order rolled back");
                Err(err)
            }
        }
    }

    /// Rolls the transaction back unless a failed branch call already did.
    async fn abandon(&self, gtx: &mut GlobalTransaction, cause: SagaError) -> SagaError {
        if gtx.status() != TransactionStatus::Active {
            return cause;
        }
        match self.coordinator.finish(gtx, Outcome::Failure).await {
            Ok(_) => cause,
            Err(err) => {
                tracing::error!(xid = %gtx.xid(), error = %err, "rollback failed");
                err
            }
        }
    }
}
