//! A participant that records every call, with injectable failures.
//!
//! Used in tests and demos to observe call order and to simulate
//! unreachable or slow participants.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{BranchId, Xid};

use crate::context::TxContext;
use crate::participant::{BranchError, BranchOperation, BranchParticipant, BranchReceipt};

/// One call as seen by a [`RecordingParticipant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Apply {
        xid: Option<Xid>,
        branch_id: Option<BranchId>,
    },
    Commit {
        xid: Xid,
        branch_id: BranchId,
    },
    Rollback {
        xid: Xid,
        branch_id: BranchId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub resource_kind: String,
    pub call: Call,
}

/// Call log that several participants can share to observe global ordering.
pub type CallLog = Arc<Mutex<Vec<RecordedCall>>>;

#[derive(Debug, Default)]
struct Behavior {
    fail_on_apply: Option<BranchError>,
    apply_delay: Option<Duration>,
    commit_failures: u32,
    rollback_failures: u32,
}

/// Records calls and optionally forwards them to a real participant.
#[derive(Clone)]
pub struct RecordingParticipant {
    kind: String,
    inner: Option<Arc<dyn BranchParticipant>>,
    calls: CallLog,
    behavior: Arc<Mutex<Behavior>>,
}

impl RecordingParticipant {
    /// Creates a participant that accepts every call without doing work.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inner: None,
            calls: CallLog::default(),
            behavior: Arc::default(),
        }
    }

    /// Wraps a real participant under its own resource kind.
    pub fn wrapping(inner: Arc<dyn BranchParticipant>) -> Self {
        Self {
            kind: inner.resource_kind().to_string(),
            inner: Some(inner),
            calls: CallLog::default(),
            behavior: Arc::default(),
        }
    }

    /// Records into `calls` instead of a private log.
    pub fn with_call_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    /// Returns every call recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every apply fail with `error`, or succeed again with `None`.
    pub fn set_fail_on_apply(&self, error: Option<BranchError>) {
        self.behavior().fail_on_apply = error;
    }

    /// Delays every apply.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        self.behavior().apply_delay = delay;
    }

    /// Fails the next `count` commits as unavailable.
    pub fn set_commit_failures(&self, count: u32) {
        self.behavior().commit_failures = count;
    }

    /// Fails the next `count` rollbacks as unavailable.
    pub fn set_rollback_failures(&self, count: u32) {
        self.behavior().rollback_failures = count;
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, Behavior> {
        self.behavior.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                resource_kind: self.kind.clone(),
                call,
            });
    }

    fn take_failure(counter: &mut u32, phase: &str) -> Result<(), BranchError> {
        if *counter == 0 {
            return Ok(());
        }
        *counter -= 1;
        Err(BranchError::unavailable(format!("injected {phase} failure")))
    }
}

#[async_trait]
impl BranchParticipant for RecordingParticipant {
    fn resource_kind(&self) -> &str {
        &self.kind
    }

    async fn apply(
        &self,
        ctx: &TxContext,
        branch_id: Option<BranchId>,
        operation: &BranchOperation,
    ) -> Result<BranchReceipt, BranchError> {
        self.record(Call::Apply {
            xid: ctx.current().cloned(),
            branch_id,
        });

        let (delay, failure) = {
            let behavior = self.behavior();
            (behavior.apply_delay, behavior.fail_on_apply.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        match &self.inner {
            Some(inner) => inner.apply(ctx, branch_id, operation).await,
            None => Ok(BranchReceipt {
                resource_kind: self.kind.clone(),
                resource_id: operation.resource_id.clone(),
                row: serde_json::Value::Null,
            }),
        }
    }

    async fn commit(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        self.record(Call::Commit {
            xid: xid.clone(),
            branch_id,
        });
        Self::take_failure(&mut self.behavior().commit_failures, "commit")?;

        match &self.inner {
            Some(inner) => inner.commit(xid, branch_id).await,
            None => Ok(()),
        }
    }

    async fn rollback(&self, xid: &Xid, branch_id: BranchId) -> Result<(), BranchError> {
        self.record(Call::Rollback {
            xid: xid.clone(),
            branch_id,
        });
        Self::take_failure(&mut self.behavior().rollback_failures, "rollback")?;

        match &self.inner {
            Some(inner) => inner.rollback(xid, branch_id).await,
            None => Ok(()),
        }
    }
}
