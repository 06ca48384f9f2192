//! Participant endpoints, mounted once per resource kind.
//!
//! The same handlers serve `/storage` and `/account`; the router state is
//! the [`LocalResource`] of that kind.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Extension, Path, Query, State};
use common::{Amount, BranchId, CommonResult, Xid};
use saga::{BranchOperation, TxContext};
use serde::Deserialize;

use crate::error::ApiError;
use crate::propagation::XID_HEADER;
use crate::state::LocalResource;

/// Query parameters of `POST /{kind}/decrease`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecreaseParams {
    pub id: String,
    pub amount: Amount,
    pub branch_id: Option<i64>,
}

/// Query parameters of the branch commit/rollback endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchParams {
    pub branch_id: i64,
}

fn bad_query(rejection: QueryRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

fn require_xid(ctx: &TxContext) -> Result<&Xid, ApiError> {
    ctx.current()
        .ok_or_else(|| ApiError::BadRequest(format!("{XID_HEADER} header is required")))
}

/// POST /{kind}/decrease: decreases one row, as a branch when an xid is bound.
pub async fn decrease(
    State(resource): State<LocalResource>,
    Extension(ctx): Extension<TxContext>,
    params: Result<Query<DecreaseParams>, QueryRejection>,
) -> Result<Json<CommonResult<serde_json::Value>>, ApiError> {
    let Query(params) = params.map_err(bad_query)?;

    let operation = BranchOperation::decrease(params.id, params.amount);
    let receipt = resource
        .participant
        .apply(&ctx, params.branch_id.map(BranchId::from), &operation)
        .await?;

    Ok(Json(CommonResult::ok(receipt.row)))
}

/// POST /{kind}/branch/commit: drops the undo record of a branch.
pub async fn commit(
    State(resource): State<LocalResource>,
    Extension(ctx): Extension<TxContext>,
    params: Result<Query<BranchParams>, QueryRejection>,
) -> Result<Json<CommonResult<()>>, ApiError> {
    let Query(params) = params.map_err(bad_query)?;
    let xid = require_xid(&ctx)?;

    resource
        .participant
        .commit(xid, BranchId::from(params.branch_id))
        .await?;

    Ok(Json(CommonResult::ok_with_message((), "branch committed")))
}

/// POST /{kind}/branch/rollback: restores the before-image of a branch.
pub async fn rollback(
    State(resource): State<LocalResource>,
    Extension(ctx): Extension<TxContext>,
    params: Result<Query<BranchParams>, QueryRejection>,
) -> Result<Json<CommonResult<()>>, ApiError> {
    let Query(params) = params.map_err(bad_query)?;
    let xid = require_xid(&ctx)?;

    resource
        .participant
        .rollback(xid, BranchId::from(params.branch_id))
        .await?;

    Ok(Json(CommonResult::ok_with_message((), "branch rolled back")))
}

/// GET /{kind}/{id}: current state of one row.
pub async fn get(
    State(resource): State<LocalResource>,
    Path(id): Path<String>,
) -> Result<Json<CommonResult<serde_json::Value>>, ApiError> {
    let kind = resource.participant.resource_kind();
    let row = resource
        .rows
        .row(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{kind} {id} not found")))?;

    Ok(Json(CommonResult::ok(row)))
}
