use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};

use crate::ai::ModelManager;
use crate::config::{Config, ServerConfig};
use crate::db::repositories::ShopsRepository;
use crate::messaging::AlertHub;
use crate::recorder::AnomalyRecorder;
use crate::security::AuthService;
use crate::streams::StreamRegistry;

pub mod alerts;
pub mod signaling;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthService>,
    pub shops: ShopsRepository,
    pub models: Arc<ModelManager>,
    pub registry: Arc<StreamRegistry>,
    pub hub: Arc<AlertHub>,
    pub recorder: Arc<AnomalyRecorder>,
    pub db: Arc<PgPool>,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", get(health))
        .route("/offer", post(signaling::handle_offer))
        .route("/users/:user_id/streams", get(signaling::list_user_streams))
        .route(
            "/users/:user_id/streams/:stream_id",
            delete(signaling::close_stream),
        )
        .route("/users/:user_id", delete(signaling::close_user_streams))
        .route("/ws/alerts/:user_id", get(alerts::alerts_ws))
        .route("/ws/connections", get(alerts::list_connections))
        .route("/ws/connections/:user_id", get(alerts::connection_stats))
        .layer(cors)
        .with_state(state)
}

/// Wildcard origins in development; the configured allow-list in
/// production. An invalid configured origin fails fast at startup.
fn build_cors_layer(server: &ServerConfig) -> CorsLayer {
    if server.is_development() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse()
                .unwrap_or_else(|e| panic!("invalid CORS origin '{}': {}", origin, e))
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "shopguard",
        "models_loaded": state.models.is_loaded(),
        "active_streams": state.registry.stream_count().await,
    }))
}
