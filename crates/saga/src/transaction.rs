//! Event-sourced global transaction.

use chrono::{DateTime, Utc};
use common::{BranchId, Xid};
use serde::{Deserialize, Serialize};
use tx_store::{JournalEntry, Sequence, StoreError};

use crate::error::{Result, SagaError};
use crate::events::{BegunData, TransactionEvent};
use crate::state::{BranchStatus, TransactionStatus};

/// A branch that joined a global transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRef {
    pub branch_id: BranchId,
    pub resource_kind: String,
    /// The saga step that created the branch.
    pub step: String,
    pub status: BranchStatus,
    /// Last commit or rollback error, while unresolved.
    pub last_error: Option<String>,
}

/// One saga instance as seen by the coordinator.
///
/// Rebuilt from its journal by [`GlobalTransaction::replay`]; every change
/// goes through [`GlobalTransaction::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTransaction {
    xid: Xid,
    name: String,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    branches: Vec<BranchRef>,
    failure_reason: Option<String>,
    #[serde(skip)]
    last_branch_id: Option<BranchId>,
    #[serde(skip)]
    sequence: Sequence,
}

impl GlobalTransaction {
    pub(crate) fn from_begun(data: &BegunData) -> Self {
        Self {
            xid: data.xid.clone(),
            name: data.name.clone(),
            status: TransactionStatus::Active,
            created_at: data.started_at,
            branches: Vec::new(),
            failure_reason: None,
            last_branch_id: None,
            sequence: Sequence::initial(),
        }
    }

    /// Rebuilds a transaction from its journal entries.
    ///
    /// Returns `None` for an empty journal.
    pub fn replay(entries: &[JournalEntry]) -> Result<Option<Self>> {
        let Some((first, rest)) = entries.split_first() else {
            return Ok(None);
        };

        let mut gtx = match serde_json::from_value(first.payload.clone())? {
            TransactionEvent::Begun(data) => Self::from_begun(&data),
            other => {
                return Err(SagaError::Store(StoreError::InvalidData(format!(
                    "journal of {} starts with {} instead of Begun",
                    first.xid,
                    other.event_type()
                ))));
            }
        };
        gtx.sequence = first.sequence;

        for entry in rest {
            let event: TransactionEvent = serde_json::from_value(entry.payload.clone())?;
            gtx.apply(event);
            gtx.sequence = entry.sequence;
        }
        Ok(Some(gtx))
    }

    /// Applies one event.
    pub fn apply(&mut self, event: TransactionEvent) {
        match event {
            TransactionEvent::Begun(data) => {
                *self = Self {
                    sequence: self.sequence,
                    ..Self::from_begun(&data)
                };
            }
            TransactionEvent::BranchRegistered(data) => {
                self.bump_branch_id(data.branch_id);
                self.branches.push(BranchRef {
                    branch_id: data.branch_id,
                    resource_kind: data.resource_kind,
                    step: data.step,
                    status: BranchStatus::Registered,
                    last_error: None,
                });
            }
            TransactionEvent::BranchFailed(data) => {
                self.bump_branch_id(data.branch_id);
                self.failure_reason = Some(data.message);
            }
            TransactionEvent::PhaseStarted(data) => {
                self.status = data.status;
                if self.failure_reason.is_none() {
                    self.failure_reason = data.reason;
                }
            }
            TransactionEvent::BranchResolved(data) => {
                if let Some(branch) = self.branch_mut(data.branch_id) {
                    branch.status = data.status;
                    branch.last_error = None;
                }
            }
            TransactionEvent::BranchUnresolved(data) => match self.branch_mut(data.branch_id) {
                Some(branch) => {
                    branch.status = BranchStatus::Unresolved;
                    branch.last_error = Some(data.error);
                }
                None => {
                    // an in-doubt branch whose rollback failed; track it from now on
                    self.bump_branch_id(data.branch_id);
                    self.branches.push(BranchRef {
                        branch_id: data.branch_id,
                        resource_kind: data.resource_kind,
                        step: String::new(),
                        status: BranchStatus::Unresolved,
                        last_error: Some(data.error),
                    });
                }
            },
            TransactionEvent::Finished(data) => {
                self.status = data.status;
            }
        }
    }

    fn bump_branch_id(&mut self, branch_id: BranchId) {
        if self.last_branch_id.is_none_or(|last| branch_id > last) {
            self.last_branch_id = Some(branch_id);
        }
    }

    fn branch_mut(&mut self, branch_id: BranchId) -> Option<&mut BranchRef> {
        self.branches.iter_mut().find(|b| b.branch_id == branch_id)
    }

    pub(crate) fn set_sequence(&mut self, sequence: Sequence) {
        self.sequence = sequence;
    }
}

// Query methods
impl GlobalTransaction {
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Registered branches in registration order.
    pub fn branches(&self) -> &[BranchRef] {
        &self.branches
    }

    /// The first failure that sent the transaction into rollback.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Last journal sequence applied.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The id the next branch call will use.
    pub fn next_branch_id(&self) -> BranchId {
        self.last_branch_id
            .map(|id| id.next())
            .unwrap_or_else(BranchId::first)
    }

    /// Branches still awaiting commit or rollback, newest first.
    pub fn open_branches_reversed(&self) -> Vec<(BranchId, String)> {
        self.branches
            .iter()
            .rev()
            .filter(|b| b.status.is_open())
            .map(|b| (b.branch_id, b.resource_kind.clone()))
            .collect()
    }

    /// Branches that need manual intervention.
    pub fn unresolved_branches(&self) -> Vec<BranchId> {
        self.branches
            .iter()
            .filter(|b| b.status == BranchStatus::Unresolved)
            .map(|b| b.branch_id)
            .collect()
    }

    pub fn is_unresolved(&self) -> bool {
        self.branches
            .iter()
            .any(|b| b.status == BranchStatus::Unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BranchFailedData, BranchUnresolvedData};
    use crate::state::BranchPhase;
    use common::ErrorCode;

    fn begun() -> GlobalTransaction {
        GlobalTransaction::from_begun(&BegunData {
            xid: Xid::generate(),
            name: "demo".to_string(),
            started_at: Utc::now(),
        })
    }

    #[test]
    fn test_begun_transaction_is_active() {
        let gtx = begun();
        assert_eq!(gtx.status(), TransactionStatus::Active);
        assert_eq!(gtx.name(), "demo");
        assert!(gtx.branches().is_empty());
        assert_eq!(gtx.next_branch_id(), BranchId::first());
    }

    #[test]
    fn test_branches_register_in_order() {
        let mut gtx = begun();
        gtx.apply(TransactionEvent::branch_registered(BranchId::new(1), "storage", "a"));
        gtx.apply(TransactionEvent::branch_registered(BranchId::new(2), "account", "b"));

        let kinds: Vec<_> = gtx.branches().iter().map(|b| b.resource_kind.as_str()).collect();
        assert_eq!(kinds, vec!["storage", "account"]);
        assert_eq!(gtx.next_branch_id(), BranchId::new(3));
    }

    #[test]
    fn test_failed_branch_consumes_id_without_registering() {
        let mut gtx = begun();
        gtx.apply(TransactionEvent::branch_registered(BranchId::new(1), "storage", "a"));
        gtx.apply(TransactionEvent::BranchFailed(BranchFailedData {
            branch_id: BranchId::new(2),
            resource_kind: "account".to_string(),
            step: "b".to_string(),
            code: ErrorCode::InsufficientResource,
            message: "insufficient balance".to_string(),
            in_doubt: false,
        }));

        assert_eq!(gtx.branches().len(), 1);
        assert_eq!(gtx.failure_reason(), Some("insufficient balance"));
        assert_eq!(gtx.next_branch_id(), BranchId::new(3));
    }

    #[test]
    fn test_rollback_lifecycle() {
        let mut gtx = begun();
        gtx.apply(TransactionEvent::branch_registered(BranchId::new(1), "storage", "a"));
        gtx.apply(TransactionEvent::phase_started(
            TransactionStatus::RollingBack,
            Some("boom".to_string()),
        ));
        assert_eq!(gtx.status(), TransactionStatus::RollingBack);

        gtx.apply(TransactionEvent::branch_resolved(
            BranchId::new(1),
            BranchStatus::RolledBack,
        ));
        gtx.apply(TransactionEvent::finished(TransactionStatus::RolledBack));

        assert_eq!(gtx.status(), TransactionStatus::RolledBack);
        assert_eq!(gtx.branches()[0].status, BranchStatus::RolledBack);
        assert_eq!(gtx.failure_reason(), Some("boom"));
    }

    #[test]
    fn test_unresolved_branch_keeps_phase() {
        let mut gtx = begun();
        gtx.apply(TransactionEvent::branch_registered(BranchId::new(1), "storage", "a"));
        gtx.apply(TransactionEvent::phase_started(TransactionStatus::Committing, None));
        gtx.apply(TransactionEvent::BranchUnresolved(BranchUnresolvedData {
            branch_id: BranchId::new(1),
            resource_kind: "storage".to_string(),
            phase: BranchPhase::Commit,
            attempts: 5,
            error: "down".to_string(),
        }));

        assert_eq!(gtx.status(), TransactionStatus::Committing);
        assert!(gtx.is_unresolved());
        assert_eq!(gtx.unresolved_branches(), vec![BranchId::new(1)]);
        assert_eq!(gtx.branches()[0].last_error.as_deref(), Some("down"));
    }

    #[test]
    fn test_unresolved_in_doubt_branch_is_tracked() {
        let mut gtx = begun();
        gtx.apply(TransactionEvent::BranchUnresolved(BranchUnresolvedData {
            branch_id: BranchId::new(1),
            resource_kind: "account".to_string(),
            phase: BranchPhase::Rollback,
            attempts: 5,
            error: "unreachable".to_string(),
        }));
        assert_eq!(gtx.unresolved_branches(), vec![BranchId::new(1)]);
        assert_eq!(gtx.next_branch_id(), BranchId::new(2));
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let xid = Xid::generate();
        let events = [
            TransactionEvent::begun(xid.clone(), "demo"),
            TransactionEvent::branch_registered(BranchId::new(1), "storage", "a"),
            TransactionEvent::phase_started(TransactionStatus::Committing, None),
            TransactionEvent::branch_resolved(BranchId::new(1), BranchStatus::Committed),
            TransactionEvent::finished(TransactionStatus::Committed),
        ];
        let entries: Vec<JournalEntry> = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                JournalEntry::new(
                    xid.clone(),
                    Sequence::new(i as i64 + 1),
                    event.event_type(),
                    event,
                )
                .unwrap()
            })
            .collect();

        let gtx = GlobalTransaction::replay(&entries).unwrap().unwrap();
        assert_eq!(gtx.xid(), &xid);
        assert_eq!(gtx.status(), TransactionStatus::Committed);
        assert_eq!(gtx.branches()[0].status, BranchStatus::Committed);
        assert_eq!(gtx.sequence(), Sequence::new(5));

        assert!(GlobalTransaction::replay(&[]).unwrap().is_none());
    }

    #[test]
    fn test_replay_rejects_journal_without_begun() {
        let xid = Xid::generate();
        let event = TransactionEvent::finished(TransactionStatus::Committed);
        let entry = JournalEntry::new(xid, Sequence::new(1), event.event_type(), &event).unwrap();
        assert!(GlobalTransaction::replay(&[entry]).is_err());
    }
}
