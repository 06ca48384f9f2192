//! Saga-mode distributed transactions for the order-placement demo.
//!
//! This crate provides:
//! - [`TxContext`]: the transaction id carried explicitly through every branch call
//! - [`BranchParticipant`]: resource owners that apply, commit and roll back
//!   branches, with [`ResourceManager`] as the local implementation backed by a
//!   compensation log
//! - [`TransactionCoordinator`]: begins global transactions, calls branches
//!   under a timeout, and commits or rolls them back with bounded retries
//! - [`SagaDefinition`] and the [`place_order`] saga built on it
//!
//! A failing branch rolls back every registered branch in reverse order.
//! Branches that cannot be resolved after retries raise a
//! [`DataInconsistencyAlert`] and stay open for [`TransactionCoordinator::recover`].

pub mod alert;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod events;
pub mod participant;
pub mod place_order;
pub mod recording;
pub mod retry;
pub mod state;
pub mod transaction;

pub use alert::{AlertSink, DataInconsistencyAlert, LogAlertSink, RecordingAlertSink};
pub use context::{ContextConflictError, TxContext};
pub use coordinator::{
    BranchOutcome, CoordinatorConfig, DEFAULT_BRANCH_TIMEOUT, RecoveryReport, SagaExecution,
    TransactionCoordinator,
};
pub use definition::{CompensationStep, SagaDefinition, SagaStep};
pub use error::{Result, SagaError};
pub use events::TransactionEvent;
pub use participant::{
    BranchError, BranchOperation, BranchParticipant, BranchReceipt, DEFAULT_LOCK_WAIT,
    ResourceManager,
};
pub use place_order::{PlaceOrder, PlacedOrder};
pub use recording::{Call, CallLog, RecordedCall, RecordingParticipant};
pub use retry::{RetriesExhausted, RetryPolicy};
pub use state::{BranchPhase, BranchStatus, Outcome, TransactionStatus};
pub use transaction::{BranchRef, GlobalTransaction};
