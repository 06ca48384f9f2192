//! Global transaction and branch state machines.

use serde::{Deserialize, Serialize};

/// The status of a global transaction.
///
/// State transitions:
/// ```text
/// Active ──┬──► Committing ──► Committed
///          └──► RollingBack ──► RolledBack
/// ```
///
/// A transaction with unresolved branches stays in `Committing` or
/// `RollingBack` until recovery resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionStatus {
    /// Branches are being called.
    #[default]
    Active,

    /// Every branch applied; commits are being sent.
    Committing,

    /// Every branch committed (terminal state).
    Committed,

    /// A branch failed; rollbacks are being sent.
    RollingBack,

    /// Every branch rolled back (terminal state).
    RolledBack,
}

impl TransactionStatus {
    /// Returns true if branches can still be called.
    pub fn can_call_branch(&self) -> bool {
        matches!(self, TransactionStatus::Active)
    }

    /// Returns true if the commit phase can start or continue.
    pub fn can_commit(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Active | TransactionStatus::Committing
        )
    }

    /// Returns true if the rollback phase can start or continue.
    pub fn can_roll_back(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Active | TransactionStatus::RollingBack
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "Active",
            TransactionStatus::Committing => "Committing",
            TransactionStatus::Committed => "Committed",
            TransactionStatus::RollingBack => "RollingBack",
            TransactionStatus::RolledBack => "RolledBack",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of one registered branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BranchStatus {
    #[default]
    Registered,
    Committed,
    RolledBack,
    /// Commit or rollback kept failing; needs manual intervention.
    Unresolved,
}

impl BranchStatus {
    /// Returns true if the branch still needs a commit or rollback.
    pub fn is_open(&self) -> bool {
        matches!(self, BranchStatus::Registered | BranchStatus::Unresolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Registered => "Registered",
            BranchStatus::Committed => "Committed",
            BranchStatus::RolledBack => "RolledBack",
            BranchStatus::Unresolved => "Unresolved",
        }
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Second-phase action sent to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchPhase {
    Commit,
    Rollback,
}

impl BranchPhase {
    /// The branch status once this phase succeeded.
    pub fn resolved_status(&self) -> BranchStatus {
        match self {
            BranchPhase::Commit => BranchStatus::Committed,
            BranchPhase::Rollback => BranchStatus::RolledBack,
        }
    }
}

impl std::fmt::Display for BranchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchPhase::Commit => write!(f, "commit"),
            BranchPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// How a saga ended, as reported to [`finish`](crate::TransactionCoordinator::finish).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_active() {
        assert_eq!(TransactionStatus::default(), TransactionStatus::Active);
    }

    #[test]
    fn test_can_call_branch() {
        assert!(TransactionStatus::Active.can_call_branch());
        assert!(!TransactionStatus::Committing.can_call_branch());
        assert!(!TransactionStatus::Committed.can_call_branch());
        assert!(!TransactionStatus::RollingBack.can_call_branch());
        assert!(!TransactionStatus::RolledBack.can_call_branch());
    }

    #[test]
    fn test_phases_do_not_cross() {
        assert!(TransactionStatus::Committing.can_commit());
        assert!(!TransactionStatus::Committing.can_roll_back());
        assert!(TransactionStatus::RollingBack.can_roll_back());
        assert!(!TransactionStatus::RollingBack.can_commit());
        assert!(!TransactionStatus::Committed.can_roll_back());
        assert!(!TransactionStatus::RolledBack.can_commit());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionStatus::Active.is_terminal());
        assert!(!TransactionStatus::Committing.is_terminal());
        assert!(!TransactionStatus::RollingBack.is_terminal());
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_open_branches() {
        assert!(BranchStatus::Registered.is_open());
        assert!(BranchStatus::Unresolved.is_open());
        assert!(!BranchStatus::Committed.is_open());
        assert!(!BranchStatus::RolledBack.is_open());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionStatus::RollingBack.to_string(), "RollingBack");
        assert_eq!(BranchStatus::Unresolved.to_string(), "Unresolved");
        assert_eq!(BranchPhase::Rollback.to_string(), "rollback");
    }

    #[test]
    fn test_serialization() {
        let status = TransactionStatus::Committing;
        let json = serde_json::to_string(&status).unwrap();
        let deserialized: TransactionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
