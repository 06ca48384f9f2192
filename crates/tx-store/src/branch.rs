use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MutateError;
use crate::{BranchKey, CompensationRecord, Result, RollbackOutcome, Row};

/// Core trait for row stores that keep a compensation log.
///
/// Every mutation is one local transaction: the row is read, checked for
/// pending branches of other transactions, changed, and (for branch work)
/// the before-image is written next to it. All implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait BranchStore<R: Row>: Send + Sync {
    /// Inserts a new row.
    ///
    /// Fails with `DuplicateRow` if the key is taken.
    async fn insert(&self, row: R) -> Result<()>;

    /// Reads a row by key.
    async fn get(&self, key: &str) -> Result<Option<R>>;

    /// Lists rows whose top-level string field `field` equals `value`.
    async fn find_by(&self, field: &str, value: &str) -> Result<Vec<R>>;

    /// Applies `change` to the row identified by `key`.
    ///
    /// With `branch = None` this is plain local work; it is refused with
    /// `ResourceBusy` while any branch is pending on the row. With a branch
    /// key, rows pending for the same transaction may be changed again and a
    /// compensation record is written atomically with the change.
    ///
    /// Returns the row as written.
    async fn mutate<F, E>(
        &self,
        key: &str,
        branch: Option<&BranchKey>,
        change: F,
    ) -> std::result::Result<R, MutateError<E>>
    where
        F: FnOnce(&R) -> std::result::Result<R, E> + Send,
        E: Send;

    /// Discards the compensation record of a branch.
    ///
    /// Returns false when there was nothing to discard.
    async fn commit(&self, branch: &BranchKey) -> Result<bool>;

    /// Writes the before-image back, discards the record and fences the branch.
    ///
    /// Idempotent: repeated calls find nothing to undo.
    async fn rollback(&self, branch: &BranchKey) -> Result<RollbackOutcome>;

    /// Returns the pending compensation record of a branch, if any.
    async fn compensation_record(&self, branch: &BranchKey) -> Result<Option<CompensationRecord>>;

    /// Lists every pending compensation record, oldest first.
    async fn pending_records(&self) -> Result<Vec<CompensationRecord>>;

    /// Returns true if the branch has been rolled back and refuses new work.
    async fn is_fenced(&self, branch: &BranchKey) -> Result<bool>;

    /// Removes fences written before `older_than`. Returns how many were removed.
    async fn purge_fences(&self, older_than: DateTime<Utc>) -> Result<usize>;
}
