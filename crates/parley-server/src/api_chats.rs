//! Chat management endpoints: listing, starting, history, purge, leave.

use crate::api_auth::UserPayload;
use crate::api_ws::MessagePayload;
use crate::middleware::AuthContext;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use parley_chats::{
    create_direct_chat, find_direct_chat, get_chat, get_user, is_member, leave_chat,
    list_chat_members, list_chats_for_user, list_messages, purge_messages, touch_chat,
    ChatOverview, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct StartChatRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

/// A chat summary as delivered to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOverviewPayload {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub members: Vec<UserPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
}

impl From<ChatOverview> for ChatOverviewPayload {
    fn from(c: ChatOverview) -> Self {
        Self {
            id: c.id,
            created_at: c.created_at,
            updated_at: c.updated_at,
            members: c.members.into_iter().map(UserPayload::from).collect(),
            last_message: c.last_message.map(MessagePayload::from),
        }
    }
}

/// Maps a [`StoreError`] to the correct HTTP status code, logging non-404
/// errors.
fn store_err_to_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        err => {
            tracing::error!(error = %err, "chat store operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Checks that the caller is a member of the chat, mapping non-membership to
/// `403`. Runs on the caller-provided connection.
fn require_member(
    conn: &rusqlite::Connection,
    chat_id: &str,
    user_id: &str,
) -> Result<(), StatusCode> {
    let member = is_member(conn, chat_id, user_id).map_err(store_err_to_status)?;
    if member {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// GET /api/chats
///
/// Returns `{chats}`, the caller's chats most recently updated first.
pub async fn list_chats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
) -> Result<Json<Value>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = claims.sub;
    let chats = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        list_chats_for_user(&conn, &user_id).map_err(store_err_to_status)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    let chats: Vec<ChatOverviewPayload> = chats.into_iter().map(ChatOverviewPayload::from).collect();
    Ok(Json(json!({ "chats": chats })))
}

/// POST /api/chats/start
///
/// Starts a direct chat with another user, or returns the existing one as
/// `{chat}`. A second start request for the same pair never creates a
/// duplicate chat.
pub async fn start_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
    Json(payload): Json<StartChatRequest>,
) -> Result<Json<Value>, StatusCode> {
    let caller_id = claims.sub;
    let peer_id = payload.user_id.trim().to_string();

    if peer_id.is_empty() || peer_id == caller_id {
        return Err(StatusCode::BAD_REQUEST);
    }

    let pool = state.pool.clone();
    let overview = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        // The peer must exist; a stale picker entry is a 404.
        get_user(&conn, &peer_id).map_err(store_err_to_status)?;

        let chat_id = match find_direct_chat(&conn, &caller_id, &peer_id)
            .map_err(store_err_to_status)?
        {
            Some(existing) => existing,
            None => {
                let chat_id = Uuid::new_v4().to_string();
                create_direct_chat(&conn, &chat_id, &caller_id, &peer_id)
                    .map_err(store_err_to_status)?;
                tracing::info!(chat_id = %chat_id, "direct chat created");
                chat_id
            }
        };

        let chat = get_chat(&conn, &chat_id).map_err(store_err_to_status)?;
        let members = list_chat_members(&conn, &chat_id).map_err(store_err_to_status)?;
        let last_message = list_messages(&conn, &chat_id, Some(1))
            .map_err(store_err_to_status)?
            .pop();

        Ok::<_, StatusCode>(ChatOverview {
            id: chat.id,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            members,
            last_message,
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(json!({ "chat": ChatOverviewPayload::from(overview) })))
}

/// GET /api/chats/{chatId}/messages
///
/// Returns `{messages}`, the newest messages of a chat in chronological
/// order. The limit is clamped server-side; members only.
pub async fn get_chat_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        require_member(&conn, &chat_id, &user_id)?;
        list_messages(&conn, &chat_id, params.limit).map_err(store_err_to_status)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    let messages: Vec<MessagePayload> = messages.into_iter().map(MessagePayload::from).collect();
    Ok(Json(json!({ "messages": messages })))
}

/// DELETE /api/chats/{chatId}/messages
///
/// Clears a chat's history. The chat itself survives; its `updated_at` is
/// bumped so listings reflect the activity.
pub async fn purge_chat_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = claims.sub;
    let purged = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        require_member(&conn, &chat_id, &user_id)?;
        let purged = purge_messages(&conn, &chat_id).map_err(store_err_to_status)?;
        touch_chat(&conn, &chat_id).map_err(store_err_to_status)?;
        tracing::info!(chat_id = %chat_id, count = purged, "chat history purged");
        Ok::<_, StatusCode>(purged)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(json!({ "ok": true, "purged": purged })))
}

/// DELETE /api/chats/{chatId}
///
/// Removes the caller from a chat. When the last member leaves, the chat and
/// its messages are deleted.
pub async fn leave_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(claims)): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = claims.sub;
    let deleted = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        require_member(&conn, &chat_id, &user_id)?;
        let deleted = leave_chat(&conn, &chat_id, &user_id).map_err(store_err_to_status)?;
        tracing::info!(chat_id = %chat_id, user_id = %user_id, deleted, "user left chat");
        Ok::<_, StatusCode>(deleted)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}
