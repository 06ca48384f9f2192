//! Integration tests for the saga coordinator and the place-order saga.

use std::sync::Arc;
use std::time::Duration;

use common::{Amount, BranchId, ErrorCode, Xid};
use domain::{Account, NewOrder, Order, OrderService, OrderStatus, Product};
use futures_util::future::join_all;
use saga::place_order::{ACCOUNT, STORAGE};
use saga::{
    BranchError, BranchOperation, BranchParticipant, BranchPhase, BranchStatus, Call, CallLog,
    CoordinatorConfig, Outcome, PlaceOrder, RecordedCall, RecordingAlertSink,
    RecordingParticipant, ResourceManager, RetryPolicy, SagaDefinition, SagaError, SagaStep,
    TransactionCoordinator, TransactionStatus, TxContext,
};
use tx_store::{BranchStore, InMemoryBranchStore, InMemoryTransactionLog};

type Storage = ResourceManager<Product, InMemoryBranchStore<Product>>;
type Accounts = ResourceManager<Account, InMemoryBranchStore<Account>>;
type Coordinator = TransactionCoordinator<InMemoryTransactionLog>;

struct TestHarness {
    coordinator: Arc<Coordinator>,
    service: PlaceOrder<InMemoryTransactionLog, InMemoryBranchStore<Order>>,
    products: InMemoryBranchStore<Product>,
    accounts: InMemoryBranchStore<Account>,
    orders: OrderService<InMemoryBranchStore<Order>>,
    storage_manager: Arc<Storage>,
    storage: RecordingParticipant,
    account: RecordingParticipant,
    calls: CallLog,
    alerts: RecordingAlertSink,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_resources(10, 1000)
    }

    fn with_resources(stock: i64, balance: i64) -> Self {
        let products = InMemoryBranchStore::with_rows([Product::new(
            "1",
            "widget",
            Amount::from_units(5),
            stock,
        )]);
        let accounts =
            InMemoryBranchStore::with_rows([Account::open("1", Amount::from_units(balance))]);
        let orders = InMemoryBranchStore::<Order>::new();

        let storage_manager: Arc<Storage> = Arc::new(
            ResourceManager::new(products.clone()).with_lock_wait(Duration::from_millis(200)),
        );
        let account_manager: Arc<Accounts> = Arc::new(
            ResourceManager::new(accounts.clone()).with_lock_wait(Duration::from_millis(200)),
        );

        let calls = CallLog::default();
        let storage =
            RecordingParticipant::wrapping(storage_manager.clone()).with_call_log(calls.clone());
        let account = RecordingParticipant::wrapping(account_manager).with_call_log(calls.clone());
        let alerts = RecordingAlertSink::new();

        let coordinator = Arc::new(
            TransactionCoordinator::new(InMemoryTransactionLog::new())
                .with_config(CoordinatorConfig {
                    branch_timeout: Duration::from_millis(500),
                    retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
                })
                .with_alert_sink(Arc::new(alerts.clone()))
                .with_participant(Arc::new(storage.clone()))
                .with_participant(Arc::new(account.clone())),
        );
        let service = PlaceOrder::new(
            coordinator.clone(),
            Arc::new(OrderService::new(orders.clone())),
        );

        Self {
            coordinator,
            service,
            products,
            accounts,
            orders: OrderService::new(orders),
            storage_manager,
            storage,
            account,
            calls,
            alerts,
        }
    }

    async fn stock(&self) -> i64 {
        self.products.get("1").await.unwrap().unwrap().stock
    }

    async fn account_row(&self) -> Account {
        self.accounts.get("1").await.unwrap().unwrap()
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The xid of the first branch apply seen by any participant.
    fn first_xid(&self) -> Xid {
        match &self.calls()[0].call {
            Call::Apply { xid: Some(xid), .. } => xid.clone(),
            other => panic!("expected an apply with xid, got {other:?}"),
        }
    }

    async fn order_status(&self, xid: &Xid) -> OrderStatus {
        self.orders.find_by_xid(xid).await.unwrap().unwrap().status
    }

    async fn transaction_status(&self, xid: &Xid) -> TransactionStatus {
        self.coordinator
            .get_transaction(xid)
            .await
            .unwrap()
            .unwrap()
            .status()
    }
}

fn order(count: i64, money: i64) -> NewOrder {
    NewOrder::new("1", "1", count, Amount::from_units(money))
}

fn summarize(calls: &[RecordedCall]) -> Vec<(String, &'static str)> {
    calls
        .iter()
        .map(|c| {
            let name = match c.call {
                Call::Apply { .. } => "apply",
                Call::Commit { .. } => "commit",
                Call::Rollback { .. } => "rollback",
            };
            (c.resource_kind.clone(), name)
        })
        .collect()
}

fn kinds(expected: &[(&str, &'static str)]) -> Vec<(String, &'static str)> {
    expected
        .iter()
        .map(|(kind, name)| (kind.to_string(), *name))
        .collect()
}

#[tokio::test]
async fn test_successful_order_decreases_balance() {
    let h = TestHarness::new();

    let placed = h.service.place(order(2, 100)).await.unwrap();

    let account = h.account_row().await;
    assert_eq!(account.residue, Amount::from_units(900));
    assert_eq!(account.used, Amount::from_units(100));
    assert!(account.is_consistent());
    assert_eq!(h.stock().await, 8);

    let stored = h.orders.get(placed.order_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Committed);
    assert_eq!(stored.xid.as_ref(), Some(&placed.xid));

    assert_eq!(
        h.transaction_status(&placed.xid).await,
        TransactionStatus::Committed
    );
    assert!(h.storage_manager.pending_records().await.unwrap().is_empty());
    assert!(h.alerts.alerts().is_empty());
}

#[tokio::test]
async fn test_stock_runs_out_after_two_orders() {
    let h = TestHarness::new();

    h.service.place(order(5, 10)).await.unwrap();
    assert_eq!(h.stock().await, 5);
    h.service.place(order(5, 10)).await.unwrap();
    assert_eq!(h.stock().await, 0);

    let err = h.service.place(order(1, 10)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientResource);
    assert!(err.to_string().starts_with("insufficient stock"));
    assert_eq!(h.stock().await, 0);
    assert_eq!(h.account_row().await.used, Amount::from_units(20));

    // the storage branch failed, so the account was never called for the third order
    let account_applies = h
        .calls()
        .iter()
        .filter(|c| c.resource_kind == ACCOUNT && matches!(c.call, Call::Apply { .. }))
        .count();
    assert_eq!(account_applies, 2);
}

#[tokio::test]
async fn test_failed_account_branch_restores_stock() {
    let h = TestHarness::new();
    h.account
        .set_fail_on_apply(Some(BranchError::validation("money must be positive")));

    let err = h.service.place(order(3, 100)).await.unwrap_err();

    assert!(matches!(err, SagaError::BranchFailed { .. }));
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(err.to_string(), "money must be positive");
    assert_eq!(h.stock().await, 10);
    assert_eq!(h.account_row().await.residue, Amount::from_units(1000));

    assert_eq!(
        summarize(&h.calls()),
        kinds(&[
            (STORAGE, "apply"),
            (ACCOUNT, "apply"),
            (STORAGE, "rollback"),
        ])
    );
    assert!(h.storage_manager.pending_records().await.unwrap().is_empty());
    assert_eq!(h.order_status(&h.first_xid()).await, OrderStatus::RolledBack);
}

#[tokio::test]
async fn test_insufficient_balance_rolls_back_and_marks_order() {
    let h = TestHarness::with_resources(10, 50);

    let err = h.service.place(order(2, 100)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientResource);
    assert!(err.to_string().starts_with("insufficient balance"));
    assert_eq!(h.stock().await, 10);

    let xid = h.first_xid();
    let gtx = h.coordinator.get_transaction(&xid).await.unwrap().unwrap();
    assert_eq!(gtx.status(), TransactionStatus::RolledBack);
    assert_eq!(gtx.branches().len(), 1);
    assert_eq!(gtx.branches()[0].status, BranchStatus::RolledBack);
    assert!(gtx.failure_reason().unwrap().starts_with("insufficient balance"));
    assert_eq!(h.order_status(&xid).await, OrderStatus::RolledBack);
}

#[tokio::test]
async fn test_count_beyond_amount_range_is_rejected() {
    let h = TestHarness::new();

    let err = h
        .service
        .place(order(NewOrder::MAX_COUNT + 1, 10))
        .await
        .unwrap_err();

    assert!(matches!(err, SagaError::Validation(_)));
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(h.calls().is_empty());
    assert_eq!(h.stock().await, 10);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_still_finishes_the_saga() {
    let h = TestHarness::new();
    h.account.set_apply_delay(Some(Duration::from_millis(300)));

    let waited = tokio::time::timeout(Duration::from_millis(50), h.service.place(order(2, 100))).await;
    assert!(waited.is_err());

    let xid = h.first_xid();
    let mut status = h.transaction_status(&xid).await;
    for _ in 0..100 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.transaction_status(&xid).await;
    }

    assert_eq!(status, TransactionStatus::Committed);
    assert_eq!(h.order_status(&xid).await, OrderStatus::Committed);
    assert_eq!(h.stock().await, 8);
    assert_eq!(h.account_row().await.used, Amount::from_units(100));
    assert!(h.storage_manager.pending_records().await.unwrap().is_empty());
    assert!(h.coordinator.recover().await.unwrap().rolled_back.is_empty());

    // the row is free again for the next order
    h.account.set_apply_delay(None);
    h.service.place(order(1, 10)).await.unwrap();
    assert_eq!(h.stock().await, 7);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_still_rolls_back_a_failing_saga() {
    let h = TestHarness::with_resources(10, 50);
    h.account.set_apply_delay(Some(Duration::from_millis(300)));

    let waited = tokio::time::timeout(Duration::from_millis(50), h.service.place(order(2, 100))).await;
    assert!(waited.is_err());

    let xid = h.first_xid();
    let mut status = h.transaction_status(&xid).await;
    for _ in 0..100 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.transaction_status(&xid).await;
    }

    assert_eq!(status, TransactionStatus::RolledBack);
    assert_eq!(h.order_status(&xid).await, OrderStatus::RolledBack);
    assert_eq!(h.stock().await, 10);
    assert!(h.storage_manager.pending_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_in_order_and_rollback_in_reverse() {
    let h = TestHarness::new();

    h.service.place(order(1, 10)).await.unwrap();
    assert_eq!(
        summarize(&h.calls()),
        kinds(&[
            (STORAGE, "apply"),
            (ACCOUNT, "apply"),
            (STORAGE, "commit"),
            (ACCOUNT, "commit"),
        ])
    );

    let h = TestHarness::new();
    let err = h.service.fail_after_branches(order(1, 10)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BusinessRuleViolation);
    assert_eq!(
        summarize(&h.calls()),
        kinds(&[
            (STORAGE, "apply"),
            (ACCOUNT, "apply"),
            (ACCOUNT, "rollback"),
            (STORAGE, "rollback"),
        ])
    );
    assert_eq!(h.stock().await, 10);
    assert_eq!(h.account_row().await.residue, Amount::from_units(1000));
}

#[tokio::test]
async fn test_second_rollback_changes_nothing() {
    let h = TestHarness::new();
    let err = h.service.fail_after_branches(order(4, 10)).await.unwrap_err();
    assert!(matches!(err, SagaError::Aborted(_)));

    let (xid, branch_id) = match &h.calls()[0].call {
        Call::Apply {
            xid: Some(xid),
            branch_id: Some(branch_id),
        } => (xid.clone(), *branch_id),
        other => panic!("expected a branch apply, got {other:?}"),
    };

    h.storage.rollback(&xid, branch_id).await.unwrap();
    h.storage.rollback(&xid, branch_id).await.unwrap();
    assert_eq!(h.stock().await, 10);
}

#[tokio::test]
async fn test_concurrent_orders_never_oversell() {
    let h = TestHarness::with_resources(5, 1000);

    let results = join_all((0..10).map(|_| h.service.place(order(1, 10)))).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count() as i64;

    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(
                err.code(),
                ErrorCode::InsufficientResource | ErrorCode::ResourceBusy
            ),
            "unexpected failure: {err}"
        );
    }

    let account = h.account_row().await;
    assert!(succeeded >= 1);
    assert_eq!(h.stock().await, 5 - succeeded);
    assert_eq!(account.used, Amount::from_units(10 * succeeded));
    assert!(account.is_consistent());
    assert!(h.storage_manager.pending_records().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_branch_is_rolled_back_and_fenced() {
    let h = TestHarness::new();
    h.account.set_apply_delay(Some(Duration::from_secs(5)));

    let err = h.service.place(order(2, 10)).await.unwrap_err();
    assert!(matches!(err, SagaError::BranchTimeout { .. }));
    assert_eq!(err.code(), ErrorCode::BranchTimeout);
    assert_eq!(h.stock().await, 10);

    // the timed-out account branch gets a rollback of its own before the stock branch
    assert_eq!(
        summarize(&h.calls()),
        kinds(&[
            (STORAGE, "apply"),
            (ACCOUNT, "apply"),
            (ACCOUNT, "rollback"),
            (STORAGE, "rollback"),
        ])
    );

    // a late apply for the rolled-back stock branch is refused
    let xid = match &h.calls()[0].call {
        Call::Apply { xid: Some(xid), .. } => xid.clone(),
        other => panic!("expected an apply with xid, got {other:?}"),
    };
    let late = h
        .storage_manager
        .apply(
            &TxContext::with_xid(xid),
            Some(BranchId::first()),
            &BranchOperation::decrease("1", Amount::from_units(2)),
        )
        .await
        .unwrap_err();
    assert_eq!(late.code, ErrorCode::TransactionFinished);
    assert_eq!(h.stock().await, 10);
}

#[tokio::test]
async fn test_exhausted_rollback_raises_one_alert_then_recovers() {
    let h = TestHarness::with_resources(10, 50);
    h.storage.set_rollback_failures(100);

    let err = h.service.place(order(2, 100)).await.unwrap_err();
    assert!(matches!(err, SagaError::Unresolved { .. }));
    assert_eq!(err.code(), ErrorCode::DataInconsistency);
    assert_eq!(h.stock().await, 8);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].phase, BranchPhase::Rollback);
    assert_eq!(alerts[0].resource_kind, STORAGE);
    assert_eq!(alerts[0].attempts, 3);

    let xid = alerts[0].xid.clone();
    let gtx = h.coordinator.get_transaction(&xid).await.unwrap().unwrap();
    assert_eq!(gtx.status(), TransactionStatus::RollingBack);
    assert_eq!(gtx.unresolved_branches(), vec![BranchId::first()]);

    h.storage.set_rollback_failures(0);
    let report = h.coordinator.recover().await.unwrap();
    assert_eq!(report.rolled_back, vec![xid.clone()]);
    assert!(report.unresolved.is_empty());
    assert_eq!(h.stock().await, 10);
    assert_eq!(h.transaction_status(&xid).await, TransactionStatus::RolledBack);
    assert_eq!(h.alerts.alerts().len(), 1);
}

#[tokio::test]
async fn test_exhausted_commit_is_reported_and_recovered() {
    let h = TestHarness::new();
    h.account.set_commit_failures(3);

    let err = h.service.place(order(1, 10)).await.unwrap_err();
    assert!(matches!(err, SagaError::Unresolved { .. }));

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].phase, BranchPhase::Commit);
    assert_eq!(alerts[0].resource_kind, ACCOUNT);
    let xid = alerts[0].xid.clone();
    assert_eq!(h.transaction_status(&xid).await, TransactionStatus::Committing);

    let report = h.coordinator.recover().await.unwrap();
    assert_eq!(report.committed, vec![xid.clone()]);
    assert_eq!(h.transaction_status(&xid).await, TransactionStatus::Committed);
    assert_eq!(h.stock().await, 9);
}

#[tokio::test]
async fn test_recovery_rolls_back_abandoned_transaction() {
    let h = TestHarness::new();

    let mut gtx = h.coordinator.begin("abandoned").await.unwrap();
    h.coordinator
        .call_branch(
            &mut gtx,
            "decrease_stock",
            STORAGE,
            &BranchOperation::decrease("1", Amount::from_units(4)),
        )
        .await
        .unwrap();
    assert_eq!(h.stock().await, 6);
    drop(gtx);

    let report = h.coordinator.recover().await.unwrap();

    assert_eq!(report.rolled_back.len(), 1);
    assert_eq!(h.stock().await, 10);
    assert!(h.coordinator.recover().await.unwrap().rolled_back.is_empty());
}

#[tokio::test]
async fn test_service_recovery_settles_the_pending_order() {
    let h = TestHarness::new();

    let mut gtx = h.coordinator.begin("demo-place-order").await.unwrap();
    let order = h
        .orders
        .create(order(3, 10), Some(gtx.xid().clone()))
        .await
        .unwrap();
    h.coordinator
        .call_branch(
            &mut gtx,
            "decrease_stock",
            STORAGE,
            &BranchOperation::decrease("1", Amount::from_units(3)),
        )
        .await
        .unwrap();
    let xid = gtx.xid().clone();
    drop(gtx);
    assert_eq!(h.stock().await, 7);

    let report = h.service.recover().await.unwrap();

    assert_eq!(report.rolled_back, vec![xid.clone()]);
    assert_eq!(h.stock().await, 10);
    let stored = h.orders.get(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::RolledBack);
    assert_eq!(h.transaction_status(&xid).await, TransactionStatus::RolledBack);

    // a second run finds nothing to do and leaves the order alone
    let report = h.service.recover().await.unwrap();
    assert!(report.rolled_back.is_empty());
    assert_eq!(h.order_status(&xid).await, OrderStatus::RolledBack);
}

#[tokio::test]
async fn test_service_recovery_settles_committing_order() {
    let h = TestHarness::new();

    let mut gtx = h.coordinator.begin("demo-place-order").await.unwrap();
    h.orders
        .create(order(1, 10), Some(gtx.xid().clone()))
        .await
        .unwrap();
    h.coordinator
        .call_branch(
            &mut gtx,
            "decrease_stock",
            STORAGE,
            &BranchOperation::decrease("1", Amount::from_units(1)),
        )
        .await
        .unwrap();
    h.storage.set_commit_failures(3);
    let err = h
        .coordinator
        .finish(&mut gtx, Outcome::Success)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::Unresolved { .. }));
    let xid = gtx.xid().clone();
    assert_eq!(h.order_status(&xid).await, OrderStatus::Pending);

    let report = h.service.recover().await.unwrap();

    assert_eq!(report.committed, vec![xid.clone()]);
    assert_eq!(h.order_status(&xid).await, OrderStatus::Committed);
    assert_eq!(h.stock().await, 9);
}

#[tokio::test]
async fn test_generic_executor_runs_definition() {
    let h = TestHarness::new();
    let definition = SagaDefinition::new("restock-check")
        .step(SagaStep::new("take", STORAGE, |n: &i64| {
            BranchOperation::decrease("1", Amount::from_units(*n))
        }))
        .step(SagaStep::new("charge", ACCOUNT, |n: &i64| {
            BranchOperation::decrease("1", Amount::from_units(*n * 10))
        }));

    let execution = h.coordinator.execute(&definition, &3).await.unwrap();

    assert_eq!(execution.branches.len(), 2);
    assert_eq!(execution.branches[1].branch_id, BranchId::new(2));
    assert_eq!(h.stock().await, 7);
    assert_eq!(h.account_row().await.used, Amount::from_units(30));
    assert_eq!(
        h.transaction_status(&execution.xid).await,
        TransactionStatus::Committed
    );

    let plan: Vec<_> = definition
        .compensation_plan()
        .into_iter()
        .map(|s| s.step)
        .collect();
    assert_eq!(plan, vec!["charge", "take"]);
}

#[tokio::test]
async fn test_finish_on_rolled_back_transaction_is_noop() {
    let h = TestHarness::new();
    let mut gtx = h.coordinator.begin("manual").await.unwrap();
    h.coordinator
        .call_branch(
            &mut gtx,
            "decrease_stock",
            STORAGE,
            &BranchOperation::decrease("1", Amount::from_units(1)),
        )
        .await
        .unwrap();

    let status = h.coordinator.finish(&mut gtx, Outcome::Failure).await.unwrap();
    assert_eq!(status, TransactionStatus::RolledBack);
    let status = h.coordinator.finish(&mut gtx, Outcome::Failure).await.unwrap();
    assert_eq!(status, TransactionStatus::RolledBack);

    let rollbacks = h
        .calls()
        .iter()
        .filter(|c| matches!(c.call, Call::Rollback { .. }))
        .count();
    assert_eq!(rollbacks, 1);
    assert_eq!(h.stock().await, 10);
}

#[tokio::test]
async fn test_unknown_transaction_is_none() {
    let h = TestHarness::new();
    assert!(
        h.coordinator
            .get_transaction(&Xid::generate())
            .await
            .unwrap()
            .is_none()
    );
}
