//! Persistence for branch participants and the transaction coordinator.
//!
//! Two concerns live here:
//!
//! - [`BranchStore`]: business rows plus the compensation log written next
//!   to them, so a branch can be undone from its before-image.
//! - [`TransactionLog`]: the coordinator's append-only journal of global
//!   transaction events.
//!
//! Each comes with an in-memory implementation for tests and a PostgreSQL one.

pub mod branch;
pub mod error;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod row;

pub use branch::BranchStore;
pub use error::{MutateError, Result, StoreError};
pub use journal::{AppendOptions, JournalEntry, Sequence, TransactionLog, validate_entries_for_append};
pub use memory::{InMemoryBranchStore, InMemoryTransactionLog};
pub use postgres::{PostgresBranchStore, PostgresTransactionLog, run_migrations};
pub use row::{BranchKey, CompensationRecord, RollbackOutcome, Row};
