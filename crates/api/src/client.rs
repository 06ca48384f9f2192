//! Branch participant reached over HTTP.
//!
//! Calls the resource endpoints of another instance of this service:
//! `POST {base}/{kind}/decrease`, `POST {base}/{kind}/branch/commit` and
//! `POST {base}/{kind}/branch/rollback`, with the xid in the
//! `transaction-id` header.

use std::time::Duration;

use async_trait::async_trait;
use common::{BranchId, CommonResult, ErrorCode, Xid};
use saga::participant::DECREASE;
use saga::{BranchError, BranchOperation, BranchParticipant, BranchReceipt, TxContext};

use crate::propagation;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A participant living in another process.
///
/// Transport failures and unreadable answers are reported as
/// `BRANCH_UNAVAILABLE`, so the coordinator treats the branch as in doubt.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    kind: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteParticipant {
    /// Creates a participant for `kind` served at `base_url`.
    pub fn new(
        kind: impl Into<String>,
        base_url: &str,
        request_timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            kind: kind.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.kind, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<serde_json::Value>, BranchError> {
        let response = request.send().await.map_err(|e| self.transport_failure(e))?;
        let status = response.status();

        let body: CommonResult<serde_json::Value> = response.json().await.map_err(|e| {
            BranchError::unavailable(format!(
                "{} answered {status} with an unreadable body: {e}",
                self.kind
            ))
        })?;

        if body.success {
            Ok(body.data)
        } else {
            Err(BranchError::new(body.code, body.message))
        }
    }

    fn transport_failure(&self, err: reqwest::Error) -> BranchError {
        if err.is_timeout() {
            return BranchError::new(
                ErrorCode::BranchTimeout,
                format!("{} did not answer in time", self.kind),
            );
        }
        tracing::warn!(resource_kind = %self.kind, error = %err, "participant unreachable");
        BranchError::unavailable(format!("{} is unreachable", self.kind))
    }

    async fn resolve(&self, phase: &str, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        let request = self
            .client
            .post(self.url(&format!("branch/{phase}")))
            .query(&[("branchId", branch_id.as_i64())]);
        let request = propagation::inject(request, &TxContext::with_xid(xid.clone()));

        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl BranchParticipant for RemoteParticipant {
    fn resource_kind(&self) -> &str {
        &self.kind
    }

    #[tracing::instrument(skip(self, ctx, operation), fields(resource_kind = %self.kind))]
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

        let mut query = vec![
            ("id", operation.resource_id.clone()),
            ("amount", operation.amount.to_string()),
        ];
        if let Some(branch_id) = branch_id {
            query.push(("branchId", branch_id.as_i64().to_string()));
        }

        let request = self.client.post(self.url(DECREASE)).query(&query);
        let row = self.send(propagation::inject(request, ctx)).await?;

        Ok(BranchReceipt {
            resource_kind: self.kind.clone(),
            resource_id: operation.resource_id.clone(),
            row: row.unwrap_or(serde_json::Value::Null),
        })
    }

    #[tracing::instrument(skip(self), fields(resource_kind = %self.kind))]
    async fn commit(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        self.resolve("commit", xid, branch_id).await
    }

    #[tracing::instrument(skip(self), fields(resource_kind = %self.kind))]
    async fn rollback(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        self.resolve("rollback", xid, branch_id).await
    }
}
