//! Rows, branch keys and compensation records.

use chrono::{DateTime, Utc};
use common::{BranchId, Xid};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A business row owned by one resource manager.
///
/// Rows are persisted as JSON under their resource kind, so one store
/// implementation serves every entity type.
pub trait Row: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The resource kind, e.g. `"storage"` or `"account"`.
    fn kind() -> &'static str;

    /// The row's primary key within its kind.
    fn key(&self) -> String;
}

/// Identifies one branch: `(xid, branch_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub xid: Xid,
    pub branch_id: BranchId,
}

impl BranchKey {
    pub fn new(xid: Xid, branch_id: BranchId) -> Self {
        Self { xid, branch_id }
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.xid, self.branch_id)
    }
}

/// Durable undo information for one applied branch.
///
/// Written in the same local transaction as the row change it describes
/// and removed once the branch is committed or rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub xid: Xid,
    pub branch_id: BranchId,
    pub resource_kind: String,
    pub resource_key: String,
    /// The row as it was before the branch changed it.
    pub before_image: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

impl CompensationRecord {
    /// Returns the branch this record belongs to.
    pub fn branch_key(&self) -> BranchKey {
        BranchKey::new(self.xid.clone(), self.branch_id)
    }
}

/// What a rollback call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The before-image was written back.
    Restored,
    /// Nothing to undo: the branch never applied, was committed, or was already rolled back.
    NothingToUndo,
}
