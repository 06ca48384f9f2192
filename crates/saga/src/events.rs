//! Journal events of a global transaction.

use chrono::{DateTime, Utc};
use common::{BranchId, ErrorCode, Xid};
use serde::{Deserialize, Serialize};

use crate::state::{BranchPhase, BranchStatus, TransactionStatus};

/// Events recorded while a global transaction runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransactionEvent {
    /// The transaction was started.
    Begun(BegunData),

    /// A branch applied and joined the transaction.
    BranchRegistered(BranchRegisteredData),

    /// A branch call failed; the branch never joined.
    BranchFailed(BranchFailedData),

    /// The second phase started.
    PhaseStarted(PhaseStartedData),

    /// A branch was committed or rolled back.
    BranchResolved(BranchResolvedData),

    /// A branch could not be committed or rolled back.
    BranchUnresolved(BranchUnresolvedData),

    /// The transaction reached a terminal status.
    Finished(FinishedData),
}

impl TransactionEvent {
    /// Returns the event name stored in the journal.
    pub fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::Begun(_) => "Begun",
            TransactionEvent::BranchRegistered(_) => "BranchRegistered",
            TransactionEvent::BranchFailed(_) => "BranchFailed",
            TransactionEvent::PhaseStarted(_) => "PhaseStarted",
            TransactionEvent::BranchResolved(_) => "BranchResolved",
            TransactionEvent::BranchUnresolved(_) => "BranchUnresolved",
            TransactionEvent::Finished(_) => "Finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BegunData {
    pub xid: Xid,
    /// The saga name, e.g. "demo-place-order".
    pub name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRegisteredData {
    pub branch_id: BranchId,
    pub resource_kind: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailedData {
    pub branch_id: BranchId,
    pub resource_kind: String,
    pub step: String,
    pub code: ErrorCode,
    pub message: String,
    /// The participant may have applied the work anyway.
    pub in_doubt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStartedData {
    /// `Committing` or `RollingBack`.
    pub status: TransactionStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchResolvedData {
    pub branch_id: BranchId,
    pub status: BranchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchUnresolvedData {
    pub branch_id: BranchId,
    pub resource_kind: String,
    pub phase: BranchPhase,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedData {
    pub status: TransactionStatus,
    pub finished_at: DateTime<Utc>,
}

// Convenience constructors
impl TransactionEvent {
    pub fn begun(xid: Xid, name: impl Into<String>) -> Self {
        TransactionEvent::Begun(BegunData {
            xid,
            name: name.into(),
            started_at: Utc::now(),
        })
    }

    pub fn branch_registered(
        branch_id: BranchId,
        resource_kind: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        TransactionEvent::BranchRegistered(BranchRegisteredData {
            branch_id,
            resource_kind: resource_kind.into(),
            step: step.into(),
        })
    }

    pub fn phase_started(status: TransactionStatus, reason: Option<String>) -> Self {
        TransactionEvent::PhaseStarted(PhaseStartedData { status, reason })
    }

    pub fn branch_resolved(branch_id: BranchId, status: BranchStatus) -> Self {
        TransactionEvent::BranchResolved(BranchResolvedData { branch_id, status })
    }

    pub fn finished(status: TransactionStatus) -> Self {
        TransactionEvent::Finished(FinishedData {
            status,
            finished_at: Utc::now(),
        })
    }
}
