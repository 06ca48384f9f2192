//! Saga demo server entry point.

use std::sync::Arc;

use api::config::Config;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tx_store::{PostgresBranchStore, PostgresTransactionLog};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Builds the router over PostgreSQL stores: migrations, demo rows, then
/// recovery of open transactions.
async fn postgres_app(config: &Config, url: &str, metrics_handle: PrometheusHandle) -> Router {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    tx_store::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let products = PostgresBranchStore::new(pool.clone());
    let accounts = PostgresBranchStore::new(pool.clone());
    api::seed_demo_rows(&products, &accounts)
        .await
        .expect("failed to seed demo rows");

    let state = api::build_state(
        config,
        PostgresTransactionLog::new(pool.clone()),
        PostgresBranchStore::new(pool),
        api::local_resource(config, products),
        api::local_resource(config, accounts),
    )
    .expect("failed to build HTTP client");

    // Finish transactions a previous run left open, before taking new work.
    match state.place_order.recover().await {
        Ok(report) => tracing::info!(
            committed = report.committed.len(),
            rolled_back = report.rolled_back.len(),
            unresolved = report.unresolved.len(),
            "recovery finished"
        ),
        Err(err) => tracing::warn!(error = %err, "recovery failed"),
    }

    let state = Arc::new(state);
    api::spawn_fence_purger(state.clone(), config);
    api::create_app(state, metrics_handle)
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Stores and application
    let app = match config.database_url.as_deref() {
        Some(url) => {
            tracing::info!("using PostgreSQL stores");
            postgres_app(&config, url, metrics_handle).await
        }
        None => {
            tracing::info!("using in-memory stores");
            let state =
                api::create_default_state(&config).expect("failed to build HTTP client");
            api::spawn_fence_purger(state.clone(), &config);
            api::create_app(state, metrics_handle)
        }
    };

    // 4. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting saga demo server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("server shut down gracefully");
}
