//! Business service endpoints: order placement and transaction inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use common::{CommonResult, OrderId, Xid};
use domain::{NewOrder, Order};
use saga::{GlobalTransaction, PlacedOrder, RecoveryReport};
use tx_store::{BranchStore, TransactionLog};

use crate::error::ApiError;
use crate::state::AppState;

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

/// POST /business/placeOrder: runs the place-order saga.
#[tracing::instrument(skip(state, body))]
pub async fn place_order<L, S>(
    State(state): State<Arc<AppState<L, S>>>,
    body: Result<Json<NewOrder>, JsonRejection>,
) -> Result<Json<CommonResult<PlacedOrder>>, ApiError>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let Json(input) = body.map_err(bad_body)?;
    let placed = state.place_order.place(input).await?;
    Ok(Json(CommonResult::ok_with_message(placed, "order placed")))
}

/// POST /business/placeOrderWithException: applies every branch, then fails.
#[tracing::instrument(skip(state, body))]
pub async fn place_order_with_exception<L, S>(
    State(state): State<Arc<AppState<L, S>>>,
    body: Result<Json<NewOrder>, JsonRejection>,
) -> Result<Json<CommonResult<PlacedOrder>>, ApiError>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let Json(input) = body.map_err(bad_body)?;
    let placed = state.place_order.fail_after_branches(input).await?;
    Ok(Json(CommonResult::ok(placed)))
}

/// GET /business/transactions/{xid}
pub async fn transaction<L, S>(
    State(state): State<Arc<AppState<L, S>>>,
    Path(xid): Path<String>,
) -> Result<Json<CommonResult<GlobalTransaction>>, ApiError>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let xid = Xid::parse(&xid).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let gtx = state
        .coordinator()
        .get_transaction(&xid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("transaction {xid} not found")))?;

    Ok(Json(CommonResult::ok(gtx)))
}

/// GET /business/orders/{id}
pub async fn order<L, S>(
    State(state): State<Arc<AppState<L, S>>>,
    Path(id): Path<String>,
) -> Result<Json<CommonResult<Order>>, ApiError>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid order id: {id}")))?;
    let order = state
        .orders
        .get(OrderId::from_uuid(uuid))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order {id} not found")))?;

    Ok(Json(CommonResult::ok(order)))
}

/// POST /business/recover: finishes transactions left open by a crash and
/// settles their orders.
#[tracing::instrument(skip(state))]
pub async fn recover<L, S>(
    State(state): State<Arc<AppState<L, S>>>,
) -> Result<Json<CommonResult<RecoveryReport>>, ApiError>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let report = state.place_order.recover().await?;
    Ok(Json(CommonResult::ok(report)))
}
