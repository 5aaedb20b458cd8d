//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::auth;
use super::keys;
use super::types::{ApiMessage, HealthResponse, TestKeyRequest};
use crate::config::AppConfig;
use crate::crypto::SecretCodec;
use crate::keys::CredentialStore;
use crate::storage::{Credential, HistoryEntry, Storage, StorageInfo};
use crate::usage::{AggregatedUsage, KeyUsage, UsageClient, UsageMonitor};

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub store: CredentialStore,
    pub monitor: UsageMonitor,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let storage = Storage::from_config(&config);
        let store = CredentialStore::new(storage, SecretCodec::new(config.passphrase.clone()));
        let monitor = UsageMonitor::new(store.clone(), UsageClient::new(&config.usage));
        Self {
            config,
            store,
            monitor,
        }
    }
}

/// Build the router over `state`.
pub fn app(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/storage", get(storage_info))
        .route("/api/data", get(get_data))
        .route("/api/config", get(keys::get_config))
        .route("/api/history", get(get_history))
        .route("/api/keys/:id/reveal", post(keys::reveal_key));

    let admin_routes = Router::new()
        .route("/api/config", post(keys::replace_config))
        .route("/api/keys", post(keys::add_key))
        .route("/api/keys/batch-update", post(keys::batch_update))
        .route("/api/keys/batch-delete", post(keys::batch_delete))
        .route("/api/keys/import", post(keys::import_keys))
        .route("/api/keys/:id", put(keys::update_key))
        .route("/api/keys/:id", delete(keys::delete_key))
        .route("/api/test-key", post(test_key))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_admin,
        ));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config));
    tracing::info!(
        "Using {} storage ({})",
        state.store.storage().kind().mode(),
        state.store.storage().kind().description()
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: state.store.storage().storage_info(),
        encryption: state.config.passphrase.source,
    })
}

async fn storage_info(State(state): State<Arc<AppState>>) -> Json<StorageInfo> {
    Json(state.store.storage().storage_info())
}

async fn get_data(State(state): State<Arc<AppState>>) -> Json<AggregatedUsage> {
    Json(state.monitor.aggregate().await)
}

async fn get_history(State(state): State<Arc<AppState>>) -> Json<Vec<HistoryEntry>> {
    Json(state.store.storage().load_history().await)
}

async fn test_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestKeyRequest>,
) -> Result<Json<KeyUsage>, (StatusCode, Json<ApiMessage>)> {
    let key = req.key.trim();
    if key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiMessage::error("Missing required field: key")),
        ));
    }
    let id = req.id.unwrap_or_else(|| "test".to_string());
    let credential = Credential::new(&id, key);
    Ok(Json(state.monitor.client().fetch(&credential).await))
}
