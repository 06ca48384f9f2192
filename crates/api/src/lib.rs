//! HTTP services for the order-placement saga.
//!
//! One binary hosts three roles: the storage and account participants
//! (`/storage/*`, `/account/*`) and the business service that coordinates
//! them (`/business/*`). Each participant is called in-process unless a
//! service URL points the coordinator at another instance over HTTP.

pub mod client;
pub mod config;
pub mod error;
pub mod propagation;
pub mod routes;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use common::Amount;
use domain::{Account, Order, OrderService, Product, Resource};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::place_order::{ACCOUNT, STORAGE};
use saga::{BranchParticipant, PlaceOrder, ResourceManager, TransactionCoordinator};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tx_store::{BranchStore, InMemoryBranchStore, InMemoryTransactionLog, StoreError, TransactionLog};

use client::RemoteParticipant;
use config::Config;
use state::{AppState, LocalResource};

/// Application state backed entirely by in-memory stores.
pub type InMemoryState = AppState<InMemoryTransactionLog, InMemoryBranchStore<Order>>;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L, S>(state: Arc<AppState<L, S>>, metrics_handle: PrometheusHandle) -> Router
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    let storage = resource_routes(state.storage.clone());
    let account = resource_routes(state.account.clone());

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/business/placeOrder",
            post(routes::business::place_order::<L, S>),
        )
        .route(
            "/business/placeOrderWithException",
            post(routes::business::place_order_with_exception::<L, S>),
        )
        .route(
            "/business/transactions/{xid}",
            get(routes::business::transaction::<L, S>),
        )
        .route(
            "/business/orders/{id}",
            get(routes::business::order::<L, S>),
        )
        .route("/business/recover", post(routes::business::recover::<L, S>))
        .with_state(state)
        .nest("/storage", storage)
        .nest("/account", account)
        .merge(metrics_router)
        .layer(axum::middleware::from_fn(propagation::bind_context))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Participant endpoints for one resource kind.
fn resource_routes(resource: LocalResource) -> Router {
    Router::new()
        .route("/decrease", post(routes::resources::decrease))
        .route("/branch/commit", post(routes::resources::commit))
        .route("/branch/rollback", post(routes::resources::rollback))
        .route("/{id}", get(routes::resources::get))
        .with_state(resource)
}

/// Wraps a row store in a resource manager using the configured lock wait.
pub fn local_resource<R, S>(config: &Config, store: S) -> LocalResource
where
    R: Resource + 'static,
    S: BranchStore<R> + 'static,
{
    LocalResource::new(ResourceManager::new(store).with_lock_wait(config.lock_wait))
}

/// Wires the coordinator, the order service and the participants together.
///
/// A participant with a service URL in `config` is reached over HTTP; the
/// local one is still served on this instance's own endpoints.
pub fn build_state<L, S>(
    config: &Config,
    log: L,
    order_store: S,
    storage: LocalResource,
    account: LocalResource,
) -> reqwest::Result<AppState<L, S>>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let mut coordinator = TransactionCoordinator::new(log).with_config(config.coordinator());
    coordinator.register(participant_for(
        config,
        STORAGE,
        config.storage_service_url.as_deref(),
        &storage,
    )?);
    coordinator.register(participant_for(
        config,
        ACCOUNT,
        config.account_service_url.as_deref(),
        &account,
    )?);

    let orders = Arc::new(OrderService::new(order_store));
    let place_order = PlaceOrder::new(Arc::new(coordinator), orders.clone());

    Ok(AppState {
        storage,
        account,
        orders,
        place_order,
    })
}

fn participant_for(
    config: &Config,
    kind: &str,
    service_url: Option<&str>,
    local: &LocalResource,
) -> reqwest::Result<Arc<dyn BranchParticipant>> {
    match service_url {
        Some(url) => {
            tracing::info!(resource_kind = kind, %url, "calling participant over HTTP");
            Ok(Arc::new(RemoteParticipant::new(kind, url, config.branch_timeout)?))
        }
        None => Ok(local.participant.clone()),
    }
}

/// Purges expired rollback fences on both local participants.
///
/// A failing participant is logged and skipped. Returns the number of
/// fences removed.
pub async fn purge_expired_fences<L, S>(state: &AppState<L, S>, retention: Duration) -> usize {
    let mut purged = 0;
    for (kind, resource) in [(STORAGE, &state.storage), (ACCOUNT, &state.account)] {
        match resource.rows.purge_expired_fences(retention).await {
            Ok(count) => purged += count,
            Err(err) => tracing::warn!(resource_kind = kind, error = %err, "fence purge failed"),
        }
    }
    purged
}

/// Purges expired fences every `fence_purge_interval` for as long as the
/// runtime lives.
pub fn spawn_fence_purger<L, S>(
    state: Arc<AppState<L, S>>,
    config: &Config,
) -> tokio::task::JoinHandle<()>
where
    L: TransactionLog + 'static,
    S: BranchStore<Order> + 'static,
{
    let retention = config.fence_retention;
    let period = config.fence_purge_interval;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let purged = purge_expired_fences(&state, retention).await;
            tracing::debug!(purged, "fence purge pass finished");
        }
    })
}

/// The product row the demo starts with.
pub fn demo_product() -> Product {
    Product::new("1", "demo product", Amount::from_units(5), 10)
}

/// The account row the demo starts with.
pub fn demo_account() -> Account {
    Account::open("1", Amount::from_units(1000))
}

/// Creates the default application state over in-memory stores seeded with
/// the demo rows.
pub fn create_default_state(config: &Config) -> reqwest::Result<Arc<InMemoryState>> {
    let storage = local_resource(config, InMemoryBranchStore::with_rows([demo_product()]));
    let account = local_resource(config, InMemoryBranchStore::with_rows([demo_account()]));

    let state = build_state(
        config,
        InMemoryTransactionLog::new(),
        InMemoryBranchStore::new(),
        storage,
        account,
    )?;
    Ok(Arc::new(state))
}

/// Inserts the demo rows, leaving rows that already exist untouched.
pub async fn seed_demo_rows<P, A>(products: &P, accounts: &A) -> tx_store::Result<()>
where
    P: BranchStore<Product>,
    A: BranchStore<Account>,
{
    insert_missing(products, demo_product()).await?;
    insert_missing(accounts, demo_account()).await
}

async fn insert_missing<R, S>(store: &S, row: R) -> tx_store::Result<()>
where
    R: Resource,
    S: BranchStore<R>,
{
    match store.insert(row).await {
        Ok(()) | Err(StoreError::DuplicateRow { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
