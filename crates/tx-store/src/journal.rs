//! Append-only journal of global transaction events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Xid;
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Position of an entry within one transaction's journal.
///
/// Sequences start at 1 for the first entry; 0 means "nothing written yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the sequence of an empty journal.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded fact about a global transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub xid: Xid,
    pub sequence: Sequence,
    /// The type of the event (e.g. "Begun", "BranchRegistered").
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Creates an entry from a serializable payload.
    pub fn new<T: Serialize>(
        xid: Xid,
        sequence: Sequence,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            xid,
            sequence,
            event_type: event_type.into(),
            payload: serde_json::to_value(payload)?,
            recorded_at: Utc::now(),
        })
    }
}

/// Options for appending journal entries.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence for optimistic concurrency control.
    pub expected_sequence: Option<Sequence>,
    /// Marks the transaction as finished; it no longer shows up in
    /// [`TransactionLog::open_transactions`].
    pub close: bool,
}

impl AppendOptions {
    /// Creates options expecting the journal to be at a specific sequence.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
            close: false,
        }
    }

    /// Also closes the transaction with this append.
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Durable journal used by the coordinator to rebuild and recover transactions.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Appends entries atomically. Returns the last sequence written.
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence>;

    /// Loads all entries of a transaction in sequence order.
    async fn load(&self, xid: &Xid) -> Result<Vec<JournalEntry>>;

    /// Lists transactions that were begun but never closed, oldest first.
    async fn open_transactions(&self) -> Result<Vec<Xid>>;
}

/// Validates entries before appending.
pub fn validate_entries_for_append(entries: &[JournalEntry]) -> Result<()> {
    let Some(first) = entries.first() else {
        return Err(StoreError::InvalidAppend(
            "Cannot append empty entry list".to_string(),
        ));
    };

    let mut expected = first.sequence;
    for entry in entries.iter().skip(1) {
        if entry.xid != first.xid {
            return Err(StoreError::InvalidAppend(
                "All entries must belong to the same transaction".to_string(),
            ));
        }
        expected = expected.next();
        if entry.sequence != expected {
            return Err(StoreError::InvalidAppend(format!(
                "Entry sequences must be contiguous. Expected {}, got {}",
                expected, entry.sequence
            )));
        }
    }

    Ok(())
}
