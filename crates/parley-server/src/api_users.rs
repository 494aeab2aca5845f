//! User directory endpoints.

use crate::api_auth::UserPayload;
use crate::middleware::AuthContext;
use crate::AppState;
use axum::{extract::Extension, http::StatusCode, response::Json};
use parley_chats::{get_user, list_users, StoreError};
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /api/users/me
///
/// Returns `{user}` with the caller's stored profile. A valid token whose
/// account has since been deleted is a 404, not a 401; the token itself is
/// still good.
pub async fn me_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
) -> Result<Json<Value>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = claims.sub;
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        get_user(&conn, &user_id).map_err(|e| match e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            err => {
                tracing::error!(error = %err, "profile lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(json!({ "user": UserPayload::from(user) })))
}

/// GET /api/users
///
/// Returns `{users}`, every registered user newest first. The directory
/// feeds the "start a chat" picker, so it includes the caller.
pub async fn list_users_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(_claims)): Extension<AuthContext>,
) -> Result<Json<Value>, StatusCode> {
    let pool = state.pool.clone();
    let users = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        list_users(&conn).map_err(|e| {
            tracing::error!(error = %e, "user listing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    let users: Vec<UserPayload> = users.into_iter().map(UserPayload::from).collect();
    Ok(Json(json!({ "users": users })))
}
