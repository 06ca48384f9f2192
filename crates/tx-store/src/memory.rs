use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Xid;
use tokio::sync::RwLock;

use crate::error::MutateError;
use crate::journal::{AppendOptions, JournalEntry, Sequence, TransactionLog, validate_entries_for_append};
use crate::{BranchKey, BranchStore, CompensationRecord, Result, RollbackOutcome, Row, StoreError};

#[derive(Debug, Clone)]
enum LogEntry {
    Pending(CompensationRecord),
    Fenced(DateTime<Utc>),
}

#[derive(Debug)]
struct BranchState<R> {
    rows: HashMap<String, R>,
    log: HashMap<BranchKey, LogEntry>,
}

impl<R> BranchState<R> {
    /// Finds a pending branch on `key` that belongs to a transaction other than `xid`.
    fn foreign_holder(&self, key: &str, xid: Option<&Xid>) -> Option<Xid> {
        self.log.values().find_map(|entry| match entry {
            LogEntry::Pending(record)
                if record.resource_key == key && Some(&record.xid) != xid =>
            {
                Some(record.xid.clone())
            }
            _ => None,
        })
    }
}

/// In-memory branch store for testing and single-process deployments.
///
/// One lock guards rows and the compensation log together, which makes
/// every mutation atomic. State does not survive a restart.
#[derive(Debug)]
pub struct InMemoryBranchStore<R> {
    state: Arc<RwLock<BranchState<R>>>,
}

impl<R> Clone for InMemoryBranchStore<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<R> Default for InMemoryBranchStore<R> {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(BranchState {
                rows: HashMap::new(),
                log: HashMap::new(),
            })),
        }
    }
}

impl<R: Row> InMemoryBranchStore<R> {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with rows.
    pub fn with_rows(rows: impl IntoIterator<Item = R>) -> Self {
        let rows = rows.into_iter().map(|row| (row.key(), row)).collect();
        Self {
            state: Arc::new(RwLock::new(BranchState {
                rows,
                log: HashMap::new(),
            })),
        }
    }

    /// Returns the number of fences currently held.
    pub async fn fence_count(&self) -> usize {
        self.state
            .read()
            .await
            .log
            .values()
            .filter(|entry| matches!(entry, LogEntry::Fenced(_)))
            .count()
    }
}

#[async_trait]
impl<R: Row> BranchStore<R> for InMemoryBranchStore<R> {
    async fn insert(&self, row: R) -> Result<()> {
        let mut state = self.state.write().await;
        let key = row.key();
        if state.rows.contains_key(&key) {
            return Err(StoreError::DuplicateRow {
                kind: R::kind(),
                key,
            });
        }
        state.rows.insert(key, row);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.state.read().await.rows.get(key).cloned())
    }

    async fn find_by(&self, field: &str, value: &str) -> Result<Vec<R>> {
        let state = self.state.read().await;
        let mut found = Vec::new();
        for row in state.rows.values() {
            let data = serde_json::to_value(row)?;
            if data.get(field).and_then(|v| v.as_str()) == Some(value) {
                found.push(row.clone());
            }
        }
        found.sort_by_key(|row| row.key());
        Ok(found)
    }

    async fn mutate<F, E>(
        &self,
        key: &str,
        branch: Option<&BranchKey>,
        change: F,
    ) -> std::result::Result<R, MutateError<E>>
    where
        F: FnOnce(&R) -> std::result::Result<R, E> + Send,
        E: Send,
    {
        let mut state = self.state.write().await;

        if let Some(branch) = branch {
            match state.log.get(branch) {
                Some(LogEntry::Fenced(_)) => {
                    return Err(StoreError::Fenced(branch.clone()).into());
                }
                Some(LogEntry::Pending(_)) => {
                    return Err(StoreError::DuplicateBranch(branch.clone()).into());
                }
                None => {}
            }
        }

        let current = state
            .rows
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::RowNotFound {
                kind: R::kind(),
                key: key.to_string(),
            })?;

        if let Some(holder) = state.foreign_holder(key, branch.map(|b| &b.xid)) {
            return Err(StoreError::ResourceBusy {
                kind: R::kind(),
                key: key.to_string(),
                holder,
            }
            .into());
        }

        let updated = change(&current).map_err(MutateError::Rejected)?;

        if let Some(branch) = branch {
            let record = CompensationRecord {
                xid: branch.xid.clone(),
                branch_id: branch.branch_id,
                resource_kind: R::kind().to_string(),
                resource_key: key.to_string(),
                before_image: serde_json::to_value(&current).map_err(StoreError::from)?,
                captured_at: Utc::now(),
            };
            state.log.insert(branch.clone(), LogEntry::Pending(record));
        }
        state.rows.insert(key.to_string(), updated.clone());

        Ok(updated)
    }

    async fn commit(&self, branch: &BranchKey) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.log.get(branch) {
            Some(LogEntry::Pending(_)) => {
                state.log.remove(branch);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rollback(&self, branch: &BranchKey) -> Result<RollbackOutcome> {
        let mut state = self.state.write().await;

        match state.log.get(branch).cloned() {
            Some(LogEntry::Pending(record)) => {
                let before: R = serde_json::from_value(record.before_image)?;
                state.rows.insert(record.resource_key, before);
                state
                    .log
                    .insert(branch.clone(), LogEntry::Fenced(Utc::now()));
                metrics::counter!("before_images_restored_total", "kind" => R::kind()).increment(1);
                Ok(RollbackOutcome::Restored)
            }
            Some(LogEntry::Fenced(_)) => Ok(RollbackOutcome::NothingToUndo),
            None => {
                state
                    .log
                    .insert(branch.clone(), LogEntry::Fenced(Utc::now()));
                Ok(RollbackOutcome::NothingToUndo)
            }
        }
    }

    async fn compensation_record(&self, branch: &BranchKey) -> Result<Option<CompensationRecord>> {
        let state = self.state.read().await;
        Ok(match state.log.get(branch) {
            Some(LogEntry::Pending(record)) => Some(record.clone()),
            _ => None,
        })
    }

    async fn pending_records(&self) -> Result<Vec<CompensationRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .log
            .values()
            .filter_map(|entry| match entry {
                LogEntry::Pending(record) => Some(record.clone()),
                LogEntry::Fenced(_) => None,
            })
            .collect();
        records.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then(a.branch_id.cmp(&b.branch_id))
        });
        Ok(records)
    }

    async fn is_fenced(&self, branch: &BranchKey) -> Result<bool> {
        let state = self.state.read().await;
        Ok(matches!(state.log.get(branch), Some(LogEntry::Fenced(_))))
    }

    async fn purge_fences(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.log.len();
        state.log.retain(|_, entry| match entry {
            LogEntry::Fenced(at) => *at >= older_than,
            LogEntry::Pending(_) => true,
        });
        Ok(before - state.log.len())
    }
}

#[derive(Debug, Default)]
struct JournalState {
    entries: HashMap<Xid, Vec<JournalEntry>>,
    /// Transactions in the order they were first written.
    opened: Vec<Xid>,
    closed: HashSet<Xid>,
}

/// In-memory transaction journal for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionLog {
    state: Arc<RwLock<JournalState>>,
}

impl InMemoryTransactionLog {
    /// Creates a new empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries stored.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        let xid = entries[0].xid.clone();
        let first_sequence = entries[0].sequence;
        let mut state = self.state.write().await;

        let current = state
            .entries
            .get(&xid)
            .and_then(|existing| existing.last())
            .map(|entry| entry.sequence)
            .unwrap_or(Sequence::initial());

        if let Some(expected) = options.expected_sequence {
            if current != expected {
                return Err(StoreError::ConcurrencyConflict {
                    xid,
                    expected,
                    actual: current,
                });
            }
        }

        if first_sequence != current.next() {
            return Err(StoreError::ConcurrencyConflict {
                xid,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let last = entries
            .last()
            .map(|entry| entry.sequence)
            .unwrap_or(current);

        if !state.entries.contains_key(&xid) {
            state.opened.push(xid.clone());
        }
        state.entries.entry(xid.clone()).or_default().extend(entries);
        if options.close {
            state.closed.insert(xid);
        }

        Ok(last)
    }

    async fn load(&self, xid: &Xid) -> Result<Vec<JournalEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .get(xid)
            .cloned()
            .unwrap_or_default())
    }

    async fn open_transactions(&self) -> Result<Vec<Xid>> {
        let state = self.state.read().await;
        Ok(state
            .opened
            .iter()
            .filter(|xid| !state.closed.contains(*xid))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BranchId;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: i64,
    }

    impl Row for Counter {
        fn kind() -> &'static str {
            "counter"
        }

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn counter(id: &str, value: i64) -> Counter {
        Counter {
            id: id.to_string(),
            value,
        }
    }

    fn branch(xid: &Xid, id: i64) -> BranchKey {
        BranchKey::new(xid.clone(), BranchId::new(id))
    }

    fn subtract(amount: i64) -> impl FnOnce(&Counter) -> std::result::Result<Counter, String> {
        move |row| {
            if row.value < amount {
                return Err(format!("only {} left", row.value));
            }
            Ok(Counter {
                id: row.id.clone(),
                value: row.value - amount,
            })
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryBranchStore::new();
        store.insert(counter("a", 1)).await.unwrap();
        let result = store.insert(counter("a", 2)).await;
        assert!(matches!(result, Err(StoreError::DuplicateRow { .. })));
    }

    #[tokio::test]
    async fn branch_mutation_writes_compensation_record() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let xid = Xid::generate();
        let key = branch(&xid, 1);

        let updated = store.mutate("a", Some(&key), subtract(3)).await.unwrap();
        assert_eq!(updated.value, 7);

        let record = store.compensation_record(&key).await.unwrap().unwrap();
        assert_eq!(record.resource_key, "a");
        assert_eq!(record.before_image["value"], 10);
        assert_eq!(store.pending_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_mutation_writes_no_record() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        store.mutate("a", None, subtract(1)).await.unwrap();
        assert!(store.pending_records().await.unwrap().is_empty());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 9);
    }

    #[tokio::test]
    async fn rejected_change_leaves_row_untouched() {
        let store = InMemoryBranchStore::with_rows([counter("a", 2)]);
        let key = branch(&Xid::generate(), 1);

        let result = store.mutate("a", Some(&key), subtract(5)).await;
        assert!(matches!(result, Err(MutateError::Rejected(_))));
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 2);
        assert!(store.compensation_record(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_row_is_reported() {
        let store: InMemoryBranchStore<Counter> = InMemoryBranchStore::new();
        let result = store.mutate("nope", None, subtract(1)).await;
        assert!(matches!(
            result,
            Err(MutateError::Store(StoreError::RowNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn pending_row_is_busy_for_other_transactions() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let first = Xid::generate();
        store
            .mutate("a", Some(&branch(&first, 1)), subtract(1))
            .await
            .unwrap();

        let other = store
            .mutate("a", Some(&branch(&Xid::generate(), 1)), subtract(1))
            .await;
        assert!(matches!(
            other,
            Err(MutateError::Store(StoreError::ResourceBusy { ref holder, .. })) if *holder == first
        ));

        let local = store.mutate("a", None, subtract(1)).await;
        assert!(matches!(
            local,
            Err(MutateError::Store(StoreError::ResourceBusy { .. }))
        ));

        // the same transaction may touch the row again
        store
            .mutate("a", Some(&branch(&first, 2)), subtract(1))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 8);
    }

    #[tokio::test]
    async fn commit_releases_the_row_and_is_idempotent() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let key = branch(&Xid::generate(), 1);
        store.mutate("a", Some(&key), subtract(4)).await.unwrap();

        assert!(store.commit(&key).await.unwrap());
        assert!(!store.commit(&key).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 6);

        store.mutate("a", None, subtract(1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 5);
    }

    #[tokio::test]
    async fn rollback_restores_before_image_once() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let key = branch(&Xid::generate(), 1);
        store.mutate("a", Some(&key), subtract(3)).await.unwrap();

        assert_eq!(store.rollback(&key).await.unwrap(), RollbackOutcome::Restored);
        assert_eq!(
            store.rollback(&key).await.unwrap(),
            RollbackOutcome::NothingToUndo
        );
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 10);
        assert!(store.pending_records().await.unwrap().is_empty());
        assert!(store.is_fenced(&key).await.unwrap());
    }

    #[tokio::test]
    async fn stacked_branches_of_one_transaction_unwind_in_reverse() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let xid = Xid::generate();
        store.mutate("a", Some(&branch(&xid, 1)), subtract(2)).await.unwrap();
        store.mutate("a", Some(&branch(&xid, 2)), subtract(3)).await.unwrap();

        store.rollback(&branch(&xid, 2)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 8);
        store.rollback(&branch(&xid, 1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 10);
    }

    #[tokio::test]
    async fn fenced_branch_refuses_late_apply() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let key = branch(&Xid::generate(), 1);

        assert_eq!(
            store.rollback(&key).await.unwrap(),
            RollbackOutcome::NothingToUndo
        );
        let late = store.mutate("a", Some(&key), subtract(1)).await;
        assert!(matches!(late, Err(MutateError::Store(StoreError::Fenced(_)))));
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 10);
    }

    #[tokio::test]
    async fn duplicate_apply_is_refused() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let key = branch(&Xid::generate(), 1);
        store.mutate("a", Some(&key), subtract(1)).await.unwrap();
        let again = store.mutate("a", Some(&key), subtract(1)).await;
        assert!(matches!(
            again,
            Err(MutateError::Store(StoreError::DuplicateBranch(_)))
        ));
    }

    #[tokio::test]
    async fn find_by_matches_string_fields() {
        let store =
            InMemoryBranchStore::with_rows([counter("b", 1), counter("a", 2), counter("c", 3)]);

        let found = store.find_by("id", "a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), "a");

        assert!(store.find_by("id", "zzz").await.unwrap().is_empty());
        // non-string fields never match
        assert!(store.find_by("value", "1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_old_fences() {
        let store = InMemoryBranchStore::with_rows([counter("a", 10)]);
        let xid = Xid::generate();
        store.rollback(&branch(&xid, 1)).await.unwrap();
        store.mutate("a", Some(&branch(&xid, 2)), subtract(1)).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.purge_fences(cutoff).await.unwrap(), 1);
        assert_eq!(store.fence_count().await, 0);
        assert_eq!(store.pending_records().await.unwrap().len(), 1);
    }

    fn journal_entry(xid: &Xid, sequence: i64) -> JournalEntry {
        JournalEntry::new(
            xid.clone(),
            Sequence::new(sequence),
            "Test",
            &serde_json::json!({"n": sequence}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn journal_append_and_load() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::generate();

        let last = log
            .append(
                vec![journal_entry(&xid, 1), journal_entry(&xid, 2)],
                AppendOptions::expect_sequence(Sequence::initial()),
            )
            .await
            .unwrap();
        assert_eq!(last, Sequence::new(2));

        let entries = log.load(&xid).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload["n"], 2);
        assert_eq!(log.entry_count().await, 2);
    }

    #[tokio::test]
    async fn journal_detects_concurrent_writers() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::generate();
        log.append(vec![journal_entry(&xid, 1)], AppendOptions::default())
            .await
            .unwrap();

        let stale = log
            .append(
                vec![journal_entry(&xid, 2)],
                AppendOptions::expect_sequence(Sequence::initial()),
            )
            .await;
        assert!(matches!(stale, Err(StoreError::ConcurrencyConflict { .. })));

        let gap = log
            .append(vec![journal_entry(&xid, 5)], AppendOptions::default())
            .await;
        assert!(matches!(gap, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn journal_tracks_open_transactions() {
        let log = InMemoryTransactionLog::new();
        let open = Xid::generate();
        let closed = Xid::generate();

        log.append(vec![journal_entry(&open, 1)], AppendOptions::default())
            .await
            .unwrap();
        log.append(vec![journal_entry(&closed, 1)], AppendOptions::default())
            .await
            .unwrap();
        log.append(
            vec![journal_entry(&closed, 2)],
            AppendOptions::expect_sequence(Sequence::new(1)).closing(),
        )
        .await
        .unwrap();

        assert_eq!(log.open_transactions().await.unwrap(), vec![open]);
    }
}
