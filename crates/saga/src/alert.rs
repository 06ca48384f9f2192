//! Operator alerts for branches that could not be resolved.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::{BranchId, Xid};
use serde::Serialize;

use crate::state::BranchPhase;

/// Raised when a branch commit or rollback keeps failing.
///
/// Not retryable by the coordinator: the branch stays unresolved until an
/// operator or a recovery run resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInconsistencyAlert {
    pub xid: Xid,
    pub branch_id: BranchId,
    pub resource_kind: String,
    pub phase: BranchPhase,
    pub attempts: u32,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

/// Destination for inconsistency alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: DataInconsistencyAlert);
}

/// Writes alerts to the error log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: DataInconsistencyAlert) {
        tracing::error!(
            xid = %alert.xid,
            branch_id = %alert.branch_id,
            resource_kind = %alert.resource_kind,
            phase = %alert.phase,
            attempts = alert.attempts,
            last_error = %alert.last_error,
            "DATA INCONSISTENCY: branch unresolved, manual intervention required"
        );
    }
}

/// Keeps alerts in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<DataInconsistencyAlert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every alert raised so far.
    pub fn alerts(&self) -> Vec<DataInconsistencyAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: DataInconsistencyAlert) {
        LogAlertSink.raise(alert.clone());
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
