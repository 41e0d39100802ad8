//! Mise Sync Agent - keeps the device-local recipe store in step with the
//! remote store.
//!
//! Runs the periodic scheduler and the retry worker in the background and
//! serves health, status and manual sync triggers over HTTP.

use axum::Router;
use mise_agent::config::Config;
use mise_agent::db::{
    self, SqliteLocalStore, SqliteMetadataStore, SqliteOperationQueue, SqliteTombstoneStore,
};
use mise_agent::remote::HttpRemoteStore;
use mise_agent::routes;
use mise_agent::store::{MemoryRemoteStore, OperationQueue, RemoteStore};
use mise_agent::sync::{
    Collaborators, FanoutObserver, HealthState, RetryWorker, Scheduler, SyncCoordinator,
    SyncSettings, TracingObserver,
};
use mise_agent::AppState;
use mise_engine::EntitySchema;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mise_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting Mise Sync Agent for {} on {}:{}",
        config.owner_id,
        config.host,
        config.port
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let remote: Arc<dyn RemoteStore> = match &config.remote_url {
        Some(url) => Arc::new(HttpRemoteStore::new(url, config.remote_timeout)?),
        None => {
            tracing::warn!("REMOTE_URL not set, syncing against an in-memory remote store");
            Arc::new(MemoryRemoteStore::new())
        }
    };
    let queue: Arc<dyn OperationQueue> = Arc::new(SqliteOperationQueue::new(pool.clone()));

    let health = HealthState::new_shared();
    let observer = FanoutObserver::new()
        .with(Arc::new(TracingObserver))
        .with(health.clone());

    let coordinator = Arc::new(SyncCoordinator::new(
        Collaborators {
            remote: remote.clone(),
            local: Arc::new(SqliteLocalStore::new(pool.clone())),
            tombstones: Arc::new(SqliteTombstoneStore::new(pool.clone())),
            queue: queue.clone(),
            metadata: Arc::new(SqliteMetadataStore::new(pool.clone())),
            assets: None,
            observer: Arc::new(observer),
        },
        SyncSettings::from(&config),
        EntitySchema::recipe(),
    ));

    // Background workers
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        coordinator.clone(),
        config.owner_id.clone(),
        config.sync_tick,
        config.stale_after,
    );
    let retry = RetryWorker::new(remote, queue)
        .with_backoff(coordinator.settings().backoff)
        .with_remote_timeout(config.remote_timeout)
        .with_poll_interval(config.retry_poll);
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));
    let retry_task = tokio::spawn(retry.run(cancel.clone()));

    // Build application state
    let state = AppState {
        coordinator,
        health,
        owner_id: Arc::from(config.owner_id.as_str()),
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = tokio::join!(scheduler_task, retry_task);
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
