use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    clear_role_error, get_entity, health_check, list_entities, list_role_errors,
    list_subscribers, post_reaction, AppState,
};
use crate::alerts::{AlertEngine, NotificationDispatcher};
use crate::config::MonitorConfig;
use crate::platform::{DiscordClient, LogMessenger, LogRoleManager, Messenger, RoleManager};
use crate::poller::HttpHealthSource;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{FileBackend, HistoryStore, Store};
use crate::subscriptions::SubscriptionRegistry;

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Entity views
        .route("/entities", get(list_entities))
        .route("/entities/:id", get(get_entity))
        // Subscriptions
        .route("/channels/:id/subscribers", get(list_subscribers))
        .route("/channels/:id/role-errors", get(list_role_errors))
        .route(
            "/channels/:id/subscribers/:user/clear-error",
            post(clear_role_error),
        )
        // Platform gateway events
        .route("/events/reactions", post(post_reaction))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Wire up the monitor and serve the API until ctrl-c
pub async fn run_server(config: MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    // Durable state
    let store = Store::new(Arc::new(FileBackend::new(config.persistence())?));

    let history = Arc::new(HistoryStore::new(&config.entities, config.history_depth));
    let restored = history.load(&store)?;
    let engine = Arc::new(AlertEngine::new(&config.entities, config.thresholds()));
    let alerted = engine.load(&store)?;
    tracing::info!(
        "Restored history for {} entities, alert state for {}",
        restored,
        alerted
    );

    // Platform collaborators
    let messenger: Arc<dyn Messenger>;
    let roles: Arc<dyn RoleManager>;
    match MonitorConfig::credentials_from_env() {
        Some(credentials) => {
            let client = Arc::new(DiscordClient::new(credentials.token, credentials.guild_id)?);
            tracing::info!("Posting alerts to Discord guild");
            messenger = client.clone();
            roles = client;
        }
        None => {
            tracing::warn!("No Discord credentials configured, alerts are written to the log");
            messenger = Arc::new(LogMessenger::new());
            roles = Arc::new(LogRoleManager);
        }
    }

    let registry = Arc::new(SubscriptionRegistry::new(
        &config.channels,
        roles,
        store.clone(),
        config.registry(),
    ));
    let rosters = registry.load()?;
    tracing::info!("Restored {} subscriber rosters", rosters);

    let dispatcher = Arc::new(NotificationDispatcher::new(
        &config.entities,
        config.channels.clone(),
        messenger,
    ));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            poll_interval: config.poll_interval(),
            persist_retry_max: config.retry_max,
            persist_backoff_base: config.retry_backoff_base(),
        },
        config.entities.clone(),
        Arc::new(HttpHealthSource::new(&config.upstream_endpoint)?),
        Arc::clone(&history),
        Arc::clone(&engine),
        dispatcher,
        store.clone(),
    ));
    scheduler.load()?;

    // Start background lanes
    let scheduler_handle = Arc::clone(&scheduler).start();
    let reconciler_handle = Arc::clone(&registry).start(config.reconcile_interval());

    let state = Arc::new(AppState {
        entities: config.entities.clone(),
        history: Arc::clone(&history),
        engine: Arc::clone(&engine),
        registry: Arc::clone(&registry),
        scheduler: Some(Arc::clone(&scheduler)),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting statuswatch API on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let the cycle in progress finish, then stop the timer
    scheduler.stop().await;
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    registry.stop();
    reconciler_handle.abort();

    history.persist(&store)?;
    engine.persist(&store)?;
    registry.persist()?;

    tracing::info!("statuswatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received, stopping workers...");
}
