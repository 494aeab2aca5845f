//! Parley server library logic.

pub mod api_auth;
pub mod api_chats;
pub mod api_users;
pub mod api_ws;
pub mod config;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use parley_db::DbPool;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across all request handlers.
///
/// Constructed once at startup and injected everywhere via an `Extension`
/// layer; nothing reads from globals.
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// HMAC secret for signing and verifying access tokens.
    pub jwt_secret: Vec<u8>,
    /// Access token lifetime in seconds.
    pub token_ttl_secs: i64,
    /// Google OAuth client id; federated login is disabled when `None`.
    pub google_client_id: Option<String>,
    /// Origin allowed to make browser requests.
    pub client_origin: String,
    /// Shared HTTP client for outbound token verification calls.
    pub http_client: reqwest::Client,
    /// Connection manager for WebSockets.
    pub connection_manager: api_ws::ConnectionManager,
}

impl AppState {
    pub fn new(pool: DbPool, config: &config::Config) -> Self {
        Self {
            pool,
            jwt_secret: config.auth.jwt_secret.as_bytes().to_vec(),
            token_ttl_secs: config.auth.token_ttl_secs,
            google_client_id: config.auth.google_client_id.clone(),
            client_origin: config.http.client_origin.clone(),
            http_client: reqwest::Client::new(),
            connection_manager: api_ws::ConnectionManager::new(),
        }
    }
}

/// Maximum request body size (64 KiB). Chat payloads are small; anything
/// larger is garbage.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/users", get(api_users::list_users_handler))
        .route("/api/users/me", get(api_users::me_handler))
        .route("/api/chats", get(api_chats::list_chats_handler))
        .route("/api/chats/start", post(api_chats::start_chat_handler))
        .route("/api/chats/{chatId}", delete(api_chats::leave_chat_handler))
        .route(
            "/api/chats/{chatId}/messages",
            get(api_chats::get_chat_history_handler)
                .delete(api_chats::purge_chat_messages_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    let cors = match state.client_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        Err(e) => {
            tracing::warn!(
                origin = %state.client_origin,
                "invalid client origin, allowing any origin: {}",
                e
            );
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/signup", post(api_auth::signup_handler))
        .route("/api/auth/login", post(api_auth::login_handler))
        .route("/api/auth/google", post(api_auth::google_login_handler))
        .merge(protected_routes)
        .route("/ws", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors)
        .layer(Extension(Arc::new(state)))
}
