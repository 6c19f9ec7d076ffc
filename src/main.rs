//! linkhub application entry point.
//!
//! Bootstraps the server:
//! 1. Load configuration from environment
//! 2. Connect to Redis
//! 3. Promote the configured admin account, if any
//! 4. Build router with API routes and the auth gates
//! 5. Start Axum server

use linkhub::{
    accounts::TracingMailer,
    auth::middleware::AppState,
    config::Config,
    metrics::{MetricsSink, TracingMetrics},
    routes,
    storage::{KvStore, KvUserDirectory, RedisStore, UserDirectory},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    // Initialize tracing with env filter support (RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config from environment; a missing signing secret ends the process here
    let config = Config::from_env().expect("Failed to load config");
    tracing::info!("Starting linkhub on {}", config.bind_addr);

    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let store: Arc<dyn KvStore> = Arc::new(
        RedisStore::connect(redis_client, config.store_timeout(), metrics.clone())
            .await
            .expect("Failed to connect to Redis"),
    );

    let users: Arc<dyn UserDirectory> = Arc::new(KvUserDirectory::new(store.clone()));
    let bind_addr = config.bind_addr;
    let admin_username = config.admin_username.clone();

    // Build shared state
    let state = AppState::new(config, store, users, metrics, Arc::new(TracingMailer));

    if let Some(username) = admin_username {
        match state.writer.promote_to_admin(&username).await {
            Ok(Some(user)) => {
                tracing::info!(user_id = %user.id, "Admin user '{}' configured", username)
            }
            Ok(None) => tracing::warn!("Admin user '{}' does not exist yet", username),
            Err(e) => panic!("Failed to promote admin user: {}", e),
        }
    }

    // Explicit CORS: deny all cross-origin requests (single-origin deployment).
    // CorsLayer::new() with no allowed origins rejects all CORS preflight requests.
    let app = routes::api_router(state)
        .layer(CorsLayer::new())
        .layer(TraceLayer::new_for_http());

    // Bind to configured address
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("Failed to bind");
    tracing::info!("Listening on {}", bind_addr);

    // Start server (with_connect_info required for ConnectInfo<SocketAddr> extractors)
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");
}
