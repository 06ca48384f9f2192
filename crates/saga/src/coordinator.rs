//! Transaction coordinator driving global transactions across branch participants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{BranchId, ErrorCode, Xid};
use serde::Serialize;
use tx_store::{AppendOptions, JournalEntry, TransactionLog};

use crate::alert::{AlertSink, DataInconsistencyAlert, LogAlertSink};
use crate::context::{self, TxContext};
use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::{BegunData, BranchFailedData, BranchUnresolvedData, TransactionEvent};
use crate::participant::{BranchError, BranchOperation, BranchParticipant, BranchReceipt};
use crate::retry::RetryPolicy;
use crate::state::{BranchPhase, Outcome, TransactionStatus};
use crate::transaction::GlobalTransaction;

/// Default time a branch call may take before it counts as failed.
pub const DEFAULT_BRANCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Upper bound for one branch apply, commit or rollback call.
    pub branch_timeout: Duration,
    /// Retry policy for commit and rollback.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            branch_timeout: DEFAULT_BRANCH_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// A branch that applied and joined the transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOutcome {
    pub branch_id: BranchId,
    pub receipt: BranchReceipt,
}

/// Result of a committed saga run by [`TransactionCoordinator::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaExecution {
    pub xid: Xid,
    pub branches: Vec<BranchOutcome>,
}

/// What a recovery run did with each open transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub committed: Vec<Xid>,
    pub rolled_back: Vec<Xid>,
    /// Transactions still needing attention after this run.
    pub unresolved: Vec<Xid>,
}

/// Drives global transactions.
///
/// Branches are applied one at a time. The first failing branch rolls back
/// every registered branch in reverse order. Every state change is journaled
/// before it takes effect in memory, so a transaction can always be rebuilt
/// with [`get_transaction`](Self::get_transaction) and finished by
/// [`recover`](Self::recover).
pub struct TransactionCoordinator<L> {
    log: L,
    participants: HashMap<String, Arc<dyn BranchParticipant>>,
    alerts: Arc<dyn AlertSink>,
    config: CoordinatorConfig,
}

impl<L: TransactionLog> TransactionCoordinator<L> {
    /// Creates a coordinator journaling to `log`.
    pub fn new(log: L) -> Self {
        Self {
            log,
            participants: HashMap::new(),
            alerts: Arc::new(LogAlertSink),
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Registers a participant under its resource kind.
    pub fn with_participant(mut self, participant: Arc<dyn BranchParticipant>) -> Self {
        self.register(participant);
        self
    }

    /// Registers a participant, replacing any previous one of the same kind.
    pub fn register(&mut self, participant: Arc<dyn BranchParticipant>) {
        let kind = participant.resource_kind().to_string();
        tracing::debug!(resource_kind = %kind, "participant registered");
        self.participants.insert(kind, participant);
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns a reference to the journal.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Starts a global transaction.
    #[tracing::instrument(skip(self))]
    pub async fn begin(&self, name: &str) -> Result<GlobalTransaction> {
        let data = BegunData {
            xid: context::begin(),
            name: name.to_string(),
            started_at: Utc::now(),
        };
        let mut gtx = GlobalTransaction::from_begun(&data);
        self.record(&mut gtx, TransactionEvent::Begun(data), false)
            .await?;

        metrics::counter!("saga_transactions_begun_total").increment(1);
        tracing::info!(xid = %gtx.xid(), "global transaction begun");
        Ok(gtx)
    }

    /// Applies one branch through the participant registered for `participant_kind`.
    ///
    /// On failure nothing is registered for the branch, every registered
    /// branch is rolled back and the original failure is returned. If that
    /// rollback leaves branches unresolved, [`SagaError::Unresolved`] is
    /// returned instead.
    #[tracing::instrument(
        skip(self, gtx, operation),
        fields(xid = %gtx.xid(), branch_id = tracing::field::Empty)
    )]
    pub async fn call_branch(
        &self,
        gtx: &mut GlobalTransaction,
        step: &str,
        participant_kind: &str,
        operation: &BranchOperation,
    ) -> Result<BranchOutcome> {
        if !gtx.status().can_call_branch() {
            return Err(SagaError::InvalidState {
                expected: TransactionStatus::Active.to_string(),
                actual: gtx.status(),
            });
        }

        let branch_id = gtx.next_branch_id();
        tracing::Span::current().record("branch_id", branch_id.as_i64());
        metrics::counter!("saga_branch_calls_total", "resource_kind" => participant_kind.to_string())
            .increment(1);

        let Some(participant) = self.participants.get(participant_kind).cloned() else {
            let failed = BranchFailedData {
                branch_id,
                resource_kind: participant_kind.to_string(),
                step: step.to_string(),
                code: ErrorCode::InternalError,
                message: format!("no participant registered for '{participant_kind}'"),
                in_doubt: false,
            };
            return Err(self
                .abandon(
                    gtx,
                    failed,
                    SagaError::UnknownParticipant(participant_kind.to_string()),
                )
                .await);
        };

        let ctx = TxContext::with_xid(gtx.xid().clone());
        let applied = tokio::time::timeout(
            self.config.branch_timeout,
            participant.apply(&ctx, Some(branch_id), operation),
        )
        .await;

        let (failed, cause) = match applied {
            Ok(Ok(receipt)) => {
                let registered =
                    TransactionEvent::branch_registered(branch_id, participant_kind, step);
                if let Err(err) = self.record(gtx, registered, false).await {
                    tracing::error!(error = %err, "could not journal applied branch, undoing it");
                    if let Err(undo) = participant.rollback(gtx.xid(), branch_id).await {
                        tracing::error!(error = %undo, "undo of unjournaled branch failed");
                    }
                    return Err(err);
                }
                tracing::info!(step, resource_kind = participant_kind, "branch registered");
                return Ok(BranchOutcome { branch_id, receipt });
            }
            Ok(Err(err)) => {
                let cause = SagaError::BranchFailed {
                    step: step.to_string(),
                    participant: participant_kind.to_string(),
                    code: err.code,
                    message: err.message.clone(),
                };
                let failed = BranchFailedData {
                    branch_id,
                    resource_kind: participant_kind.to_string(),
                    step: step.to_string(),
                    code: err.code,
                    in_doubt: err.is_in_doubt(),
                    message: err.message,
                };
                (failed, cause)
            }
            Err(_elapsed) => {
                let cause = SagaError::BranchTimeout {
                    step: step.to_string(),
                    participant: participant_kind.to_string(),
                    timeout: self.config.branch_timeout,
                };
                let failed = BranchFailedData {
                    branch_id,
                    resource_kind: participant_kind.to_string(),
                    step: step.to_string(),
                    code: ErrorCode::BranchTimeout,
                    message: cause.to_string(),
                    in_doubt: true,
                };
                (failed, cause)
            }
        };

        metrics::counter!("saga_branch_failures_total", "resource_kind" => participant_kind.to_string())
            .increment(1);
        tracing::warn!(
            step,
            resource_kind = participant_kind,
            code = %failed.code,
            error = %failed.message,
            in_doubt = failed.in_doubt,
            "branch failed"
        );

        Err(self.abandon(gtx, failed, cause).await)
    }

    /// Journals a failed branch and rolls the transaction back.
    ///
    /// Returns the error the caller should surface.
    async fn abandon(
        &self,
        gtx: &mut GlobalTransaction,
        failed: BranchFailedData,
        cause: SagaError,
    ) -> SagaError {
        match self.try_abandon(gtx, failed).await {
            Ok(()) => cause,
            Err(err) => {
                if !matches!(err, SagaError::Unresolved { .. }) {
                    tracing::error!(xid = %gtx.xid(), error = %err, "rollback after branch failure failed");
                }
                err
            }
        }
    }

    async fn try_abandon(&self, gtx: &mut GlobalTransaction, failed: BranchFailedData) -> Result<()> {
        let registered = gtx.open_branches_reversed();
        let in_doubt = failed
            .in_doubt
            .then(|| (failed.branch_id, failed.resource_kind.clone()));
        let reason = failed.message.clone();

        self.record(gtx, TransactionEvent::BranchFailed(failed), false)
            .await?;
        self.start_phase(gtx, TransactionStatus::RollingBack, Some(reason))
            .await?;

        // the participant may have applied anyway; rolling it back also fences the key
        if let Some((branch_id, resource_kind)) = in_doubt {
            self.resolve(gtx, branch_id, &resource_kind, BranchPhase::Rollback)
                .await?;
        }
        for (branch_id, resource_kind) in registered {
            self.resolve(gtx, branch_id, &resource_kind, BranchPhase::Rollback)
                .await?;
        }
        self.close(gtx, TransactionStatus::RolledBack).await
    }

    /// Ends the transaction.
    ///
    /// `Success` commits every branch in registration order. `Failure` rolls
    /// every branch back in reverse order and is a no-op on an already
    /// rolled back transaction.
    #[tracing::instrument(skip(self, gtx), fields(xid = %gtx.xid()))]
    pub async fn finish(
        &self,
        gtx: &mut GlobalTransaction,
        outcome: Outcome,
    ) -> Result<TransactionStatus> {
        match outcome {
            Outcome::Success => {
                if gtx.status() != TransactionStatus::Active {
                    return Err(SagaError::InvalidState {
                        expected: TransactionStatus::Active.to_string(),
                        actual: gtx.status(),
                    });
                }
                self.commit_all(gtx).await?;
            }
            Outcome::Failure => match gtx.status() {
                TransactionStatus::RolledBack => {
                    tracing::debug!("already rolled back");
                }
                status if status.can_roll_back() => {
                    self.roll_back(gtx, None).await?;
                }
                status => {
                    return Err(SagaError::InvalidState {
                        expected: "Active or RollingBack".to_string(),
                        actual: status,
                    });
                }
            },
        }
        Ok(gtx.status())
    }

    /// Commits every open branch in registration order.
    async fn commit_all(&self, gtx: &mut GlobalTransaction) -> Result<()> {
        self.start_phase(gtx, TransactionStatus::Committing, None)
            .await?;

        let mut open = gtx.open_branches_reversed();
        open.reverse();
        for (branch_id, resource_kind) in open {
            self.resolve(gtx, branch_id, &resource_kind, BranchPhase::Commit)
                .await?;
        }
        self.close(gtx, TransactionStatus::Committed).await
    }

    /// Rolls every open branch back in reverse registration order.
    async fn roll_back(&self, gtx: &mut GlobalTransaction, reason: Option<String>) -> Result<()> {
        self.start_phase(gtx, TransactionStatus::RollingBack, reason)
            .await?;

        for (branch_id, resource_kind) in gtx.open_branches_reversed() {
            self.resolve(gtx, branch_id, &resource_kind, BranchPhase::Rollback)
                .await?;
        }
        self.close(gtx, TransactionStatus::RolledBack).await
    }

    async fn start_phase(
        &self,
        gtx: &mut GlobalTransaction,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        if gtx.status() == status {
            return Ok(());
        }
        tracing::info!(xid = %gtx.xid(), %status, "second phase started");
        self.record(gtx, TransactionEvent::phase_started(status, reason), false)
            .await
    }

    /// Finishes the transaction unless a branch is unresolved.
    async fn close(&self, gtx: &mut GlobalTransaction, status: TransactionStatus) -> Result<()> {
        if gtx.is_unresolved() {
            return Err(SagaError::Unresolved {
                xid: gtx.xid().clone(),
                branches: gtx.unresolved_branches(),
            });
        }

        self.record(gtx, TransactionEvent::finished(status), true)
            .await?;

        let duration = (Utc::now() - gtx.created_at()).num_milliseconds() as f64 / 1000.0;
        metrics::histogram!("saga_duration_seconds").record(duration);
        match status {
            TransactionStatus::Committed => {
                metrics::counter!("saga_transactions_committed_total").increment(1)
            }
            _ => metrics::counter!("saga_transactions_rolled_back_total").increment(1),
        }
        tracing::info!(xid = %gtx.xid(), %status, duration, "global transaction finished");
        Ok(())
    }

    /// Commits or rolls back one branch with retries.
    ///
    /// Exhausted retries mark the branch unresolved and raise an alert; the
    /// caller carries on with the remaining branches.
    #[tracing::instrument(skip(self, gtx), fields(xid = %gtx.xid()))]
    async fn resolve(
        &self,
        gtx: &mut GlobalTransaction,
        branch_id: BranchId,
        resource_kind: &str,
        phase: BranchPhase,
    ) -> Result<()> {
        let result = match self.participants.get(resource_kind).cloned() {
            Some(participant) => {
                let xid = gtx.xid().clone();
                let timeout = self.config.branch_timeout;
                self.config
                    .retry
                    .run(|attempt| {
                        let participant = Arc::clone(&participant);
                        let xid = xid.clone();
                        async move {
                            tracing::debug!(attempt, %phase, "calling branch");
                            let call = match phase {
                                BranchPhase::Commit => participant.commit(&xid, branch_id),
                                BranchPhase::Rollback => participant.rollback(&xid, branch_id),
                            };
                            tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                                Err(BranchError::new(
                                    ErrorCode::BranchTimeout,
                                    format!("{phase} timed out after {timeout:?}"),
                                ))
                            })
                        }
                    })
                    .await
                    .map_err(|exhausted| (exhausted.attempts, exhausted.last_error.to_string()))
            }
            None => Err((0, format!("no participant registered for '{resource_kind}'"))),
        };

        match result {
            Ok(()) => {
                self.record(
                    gtx,
                    TransactionEvent::branch_resolved(branch_id, phase.resolved_status()),
                    false,
                )
                .await
            }
            Err((attempts, error)) => {
                let alert = DataInconsistencyAlert {
                    xid: gtx.xid().clone(),
                    branch_id,
                    resource_kind: resource_kind.to_string(),
                    phase,
                    attempts,
                    last_error: error.clone(),
                    raised_at: Utc::now(),
                };
                self.record(
                    gtx,
                    TransactionEvent::BranchUnresolved(BranchUnresolvedData {
                        branch_id,
                        resource_kind: resource_kind.to_string(),
                        phase,
                        attempts,
                        error,
                    }),
                    false,
                )
                .await?;

                metrics::counter!("saga_data_inconsistency_alerts_total").increment(1);
                self.alerts.raise(alert);
                Ok(())
            }
        }
    }

    /// Loads a transaction by replaying its journal.
    pub async fn get_transaction(&self, xid: &Xid) -> Result<Option<GlobalTransaction>> {
        let entries = self.log.load(xid).await?;
        GlobalTransaction::replay(&entries)
    }

    /// Drives every transaction left open to a terminal status.
    ///
    /// `Active` and `RollingBack` transactions are rolled back, `Committing`
    /// ones committed. Must not run while sagas are executing in this
    /// process: an `Active` transaction is indistinguishable from an
    /// abandoned one.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for xid in self.log.open_transactions().await? {
            match self.recover_one(&xid).await {
                Ok(TransactionStatus::Committed) => report.committed.push(xid),
                Ok(TransactionStatus::RolledBack) => report.rolled_back.push(xid),
                Ok(status) => {
                    tracing::warn!(%xid, %status, "transaction left open after recovery");
                    report.unresolved.push(xid);
                }
                Err(err) => {
                    tracing::error!(%xid, error = %err, "recovery failed");
                    report.unresolved.push(xid);
                }
            }
        }

        tracing::info!(
            committed = report.committed.len(),
            rolled_back = report.rolled_back.len(),
            unresolved = report.unresolved.len(),
            "recovery finished"
        );
        Ok(report)
    }

    async fn recover_one(&self, xid: &Xid) -> Result<TransactionStatus> {
        let mut gtx = self
            .get_transaction(xid)
            .await?
            .ok_or_else(|| SagaError::TransactionNotFound(xid.clone()))?;

        match gtx.status() {
            TransactionStatus::Committing => self.commit_all(&mut gtx).await?,
            TransactionStatus::Active | TransactionStatus::RollingBack => {
                self.roll_back(&mut gtx, Some("abandoned, rolled back by recovery".to_string()))
                    .await?
            }
            TransactionStatus::Committed | TransactionStatus::RolledBack => {}
        }
        Ok(gtx.status())
    }

    /// Runs the steps of `definition` as branches of `gtx`, in order.
    ///
    /// Stops at the first failing step; by then the transaction is rolled back.
    pub async fn execute_steps<I>(
        &self,
        gtx: &mut GlobalTransaction,
        definition: &SagaDefinition<I>,
        input: &I,
    ) -> Result<Vec<BranchOutcome>> {
        let mut outcomes = Vec::with_capacity(definition.steps().len());
        for step in definition.steps() {
            tracing::info!(step = step.name(), participant = step.participant(), "saga step started");
            let operation = step.operation(input);
            let outcome = self
                .call_branch(gtx, step.name(), step.participant(), &operation)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Runs a whole saga: begin, every step in order, then commit.
    #[tracing::instrument(skip(self, definition, input), fields(saga = definition.name()))]
    pub async fn execute<I>(
        &self,
        definition: &SagaDefinition<I>,
        input: &I,
    ) -> Result<SagaExecution> {
        let mut gtx = self.begin(definition.name()).await?;
        let branches = self.execute_steps(&mut gtx, definition, input).await?;
        self.finish(&mut gtx, Outcome::Success).await?;

        Ok(SagaExecution {
            xid: gtx.xid().clone(),
            branches,
        })
    }

    /// Appends one event to the journal, then applies it.
    async fn record(
        &self,
        gtx: &mut GlobalTransaction,
        event: TransactionEvent,
        close: bool,
    ) -> Result<()> {
        let current = gtx.sequence();
        let entry = JournalEntry::new(gtx.xid().clone(), current.next(), event.event_type(), &event)?;

        let mut options = AppendOptions::expect_sequence(current);
        if close {
            options = options.closing();
        }
        let last = self.log.append(vec![entry], options).await?;

        gtx.apply(event);
        gtx.set_sequence(last);
        Ok(())
    }
}
