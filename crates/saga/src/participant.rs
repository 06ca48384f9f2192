//! Branch participants: the resource owners a saga calls.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Amount, BranchId, ErrorCode, Xid};
use domain::{DomainError, Resource};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tx_store::{BranchKey, BranchStore, CompensationRecord, MutateError, RollbackOutcome, StoreError};

use crate::context::TxContext;

/// Name of the decrease operation, the only one resource managers support.
pub const DECREASE: &str = "decrease";

/// Default time a branch waits for a row held by another transaction.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(300);

/// Interval between attempts while waiting for a held row.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One operation sent to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOperation {
    pub name: String,
    pub resource_id: String,
    pub amount: Amount,
}

impl BranchOperation {
    /// Creates a decrease of `amount` on the row `resource_id`.
    pub fn decrease(resource_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            name: DECREASE.to_string(),
            resource_id: resource_id.into(),
            amount,
        }
    }
}

/// What a participant reports back after applying a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchReceipt {
    pub resource_kind: String,
    pub resource_id: String,
    /// The row as written by the branch.
    pub row: serde_json::Value,
}

/// A failure reported by a participant: `{code, message}` and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct BranchError {
    pub code: ErrorCode,
    pub message: String,
}

impl BranchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BranchUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Returns true if the participant may have applied the work despite the error.
    pub fn is_in_doubt(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::BranchTimeout | ErrorCode::BranchUnavailable | ErrorCode::InternalError
        )
    }
}

/// A resource owner that takes part in global transactions.
///
/// `apply` does the work and commits it locally at once, keeping what it
/// needs to undo it. `commit` and `rollback` must be idempotent.
#[async_trait]
pub trait BranchParticipant: Send + Sync {
    /// The resource kind this participant owns, e.g. `"storage"`.
    fn resource_kind(&self) -> &str;

    /// Applies one operation.
    ///
    /// With an xid in `ctx` the work belongs to branch `branch_id` of that
    /// transaction; without one it is plain local work.
    async fn apply(
        &self,
        ctx: &TxContext,
        branch_id: Option<BranchId>,
        operation: &BranchOperation,
    ) -> Result<BranchReceipt, BranchError>;

    /// Discards the undo information of a branch.
    async fn commit(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError>;

    /// Undoes a branch and refuses any later apply for it.
    async fn rollback(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError>;
}

/// Local resource manager for one kind of [`Resource`] row.
pub struct ResourceManager<R, S> {
    store: S,
    lock_wait: Duration,
    _row: PhantomData<fn() -> R>,
}

impl<R, S> ResourceManager<R, S>
where
    R: Resource,
    S: BranchStore<R>,
{
    /// Creates a resource manager over `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock_wait: DEFAULT_LOCK_WAIT,
            _row: PhantomData,
        }
    }

    /// Sets how long a branch waits for a row held by another transaction.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads a row.
    pub async fn get(&self, id: &str) -> Result<Option<R>, BranchError> {
        self.store.get(id).await.map_err(Self::store_failure)
    }

    /// Lists durable compensation records, for recovery tooling.
    pub async fn pending_records(&self) -> Result<Vec<CompensationRecord>, BranchError> {
        self.store
            .pending_records()
            .await
            .map_err(Self::store_failure)
    }

    /// Drops rollback fences older than `retention`. Returns how many went.
    ///
    /// A fence only has to outlive the longest late apply the coordinator
    /// can still send, so a retention well above the branch timeout is safe.
    pub async fn purge_expired_fences(&self, retention: Duration) -> Result<usize, BranchError> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self
            .store
            .purge_fences(cutoff)
            .await
            .map_err(Self::store_failure)?;

        metrics::counter!("fences_purged_total", "resource_kind" => R::kind()).increment(purged as u64);
        if purged > 0 {
            tracing::info!(resource_kind = R::kind(), purged, "expired fences purged");
        }
        Ok(purged)
    }

    /// Decreases a row, waiting up to the lock wait while it is held.
    async fn decrease(
        &self,
        branch: Option<&BranchKey>,
        id: &str,
        amount: Amount,
    ) -> Result<R, BranchError> {
        let deadline = Instant::now() + self.lock_wait;

        loop {
            match self
                .store
                .mutate(id, branch, |row: &R| row.decrease(amount))
                .await
            {
                Ok(row) => return Ok(row),
                Err(MutateError::Store(StoreError::ResourceBusy { ref holder, .. }))
                    if Instant::now() < deadline =>
                {
                    tracing::debug!(resource_kind = R::kind(), id, %holder, "row busy, waiting");
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(err) => return Err(Self::domain_failure(DomainError::from(err))),
            }
        }
    }

    fn domain_failure(err: DomainError) -> BranchError {
        let code = err.code();
        if code == ErrorCode::InternalError {
            tracing::error!(resource_kind = R::kind(), error = %err, "branch work failed");
            return BranchError::internal(format!("{} participant failed internally", R::kind()));
        }
        BranchError::new(code, err.to_string())
    }

    fn store_failure(err: StoreError) -> BranchError {
        Self::domain_failure(DomainError::Store(err))
    }
}

#[async_trait]
impl<R, S> BranchParticipant for ResourceManager<R, S>
where
    R: Resource,
    S: BranchStore<R>,
{
    fn resource_kind(&self) -> &str {
        R::kind()
    }

    #[tracing::instrument(
        skip(self, ctx, operation),
        fields(resource_kind = R::kind(), xid = ?ctx.current(), id = %operation.resource_id)
    )]
    async fn apply(
        &self,
        ctx: &TxContext,
        branch_id: Option<BranchId>,
        operation: &BranchOperation,
    ) -> Result<BranchReceipt, BranchError> {
        if operation.name != DECREASE {
            return Err(BranchError::validation(format!(
                "unsupported operation '{}'",
                operation.name
            )));
        }
        if operation.resource_id.trim().is_empty() {
            return Err(BranchError::validation("id must not be empty"));
        }

        let branch = match (ctx.current(), branch_id) {
            (Some(xid), Some(branch_id)) => Some(BranchKey::new(xid.clone(), branch_id)),
            (Some(_), None) => {
                return Err(BranchError::validation(
                    "branchId is required inside a global transaction",
                ));
            }
            (None, _) => None,
        };

        let row = self
            .decrease(branch.as_ref(), &operation.resource_id, operation.amount)
            .await?;

        metrics::counter!("branch_applied_total", "resource_kind" => R::kind()).increment(1);
        tracing::info!(amount = %operation.amount, "branch applied");

        Ok(BranchReceipt {
            resource_kind: R::kind().to_string(),
            resource_id: operation.resource_id.clone(),
            row: serde_json::to_value(&row)
                .map_err(|e| Self::store_failure(StoreError::from(e)))?,
        })
    }

    #[tracing::instrument(skip(self), fields(resource_kind = R::kind()))]
    async fn commit(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        let discarded = self
            .store
            .commit(&BranchKey::new(xid.clone(), branch_id))
            .await
            .map_err(Self::store_failure)?;

        if !discarded {
            tracing::debug!("nothing to commit");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(resource_kind = R::kind()))]
    async fn rollback(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        let outcome = self
            .store
            .rollback(&BranchKey::new(xid.clone(), branch_id))
            .await
            .map_err(Self::store_failure)?;

        match outcome {
            RollbackOutcome::Restored => {
                metrics::counter!("branch_rolled_back_total", "resource_kind" => R::kind())
                    .increment(1);
                tracing::info!("branch rolled back");
            }
            RollbackOutcome::NothingToUndo => tracing::debug!("nothing to roll back"),
        }
        Ok(())
    }
}
