//! WebSocket API handler and connection management.
//!
//! One authenticated WebSocket per browser tab. The [`ConnectionManager`]
//! owns all live-connection state: the presence registry (who is online) and
//! the room subscriptions (which connections receive which chat's events).
//! Handlers never touch those maps directly; all mutation goes through the
//! manager's methods.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_chats::{create_message, is_member, touch_chat, CreateMessageParams, Message};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// Query parameters for the WebSocket connection.
///
/// The access token is passed out-of-band as a query parameter because
/// browsers cannot set headers on WebSocket upgrades.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// A user visible in the presence snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Incoming WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "chat:join")]
    Join {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    #[serde(rename = "chat:leave")]
    Leave {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    #[serde(rename = "chat:message")]
    Message {
        #[serde(rename = "chatId")]
        chat_id: String,
        text: String,
    },
}

/// A message as delivered over the WebSocket, with camelCase field names and
/// the sender's denormalized display fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: String,
    pub sender: SenderPayload,
}

/// Sender display fields embedded in a message payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderPayload {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl From<Message> for MessagePayload {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            chat_id: m.chat_id,
            sender_id: m.sender_id.clone(),
            text: m.body,
            created_at: m.created_at,
            sender: SenderPayload {
                id: m.sender_id,
                name: m.sender_name,
                avatar_url: m.sender_avatar_url,
            },
        }
    }
}

/// Outgoing WebSocket event types.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Full presence snapshot, keyed by user id. Sent to every connection on
    /// each connect and disconnect.
    #[serde(rename = "presence:update")]
    Presence { users: BTreeMap<String, PresenceUser> },
    /// A persisted chat message, fanned out to the chat's room.
    #[serde(rename = "chat:message")]
    Message { message: MessagePayload },
}

/// One live connection: the identity from its verified handshake, and the
/// outbound channel feeding its socket.
#[derive(Debug, Clone)]
struct Session {
    identity: PresenceUser,
    sender: mpsc::Sender<String>,
}

/// Manages active WebSocket connections and room subscriptions.
///
/// Sessions are keyed by connection id, not user id: a user with several
/// tabs holds several sessions, and stays present until the last one closes.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    /// Active sessions: connection_id -> session.
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    /// Room subscriptions: chat_id -> set of connection ids.
    rooms: Arc<RwLock<HashMap<String, HashSet<Uuid>>>>,
    /// Reverse mapping: connection_id -> set of chat ids.
    connection_rooms: Arc<RwLock<HashMap<Uuid, HashSet<String>>>>,
    /// Per-chat send locks, so persisted order equals broadcast order within
    /// a chat.
    chat_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its id.
    pub async fn add_connection(
        &self,
        identity: PresenceUser,
        sender: mpsc::Sender<String>,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.sessions
            .write()
            .await
            .insert(connection_id, Session { identity, sender });
        connection_id
    }

    /// Returns the identity bound to a connection, if it is still registered.
    pub async fn identity(&self, connection_id: Uuid) -> Option<PresenceUser> {
        let sessions = self.sessions.read().await;
        sessions.get(&connection_id).map(|s| s.identity.clone())
    }

    /// Removes a connection and drops all of its room memberships.
    ///
    /// Idempotent: removing an unknown connection is a no-op.
    ///
    /// Lock ordering: sessions, then rooms, then connection_rooms. `join`
    /// and `leave` acquire in the same order to prevent deadlocks.
    pub async fn remove_connection(&self, connection_id: Uuid) {
        // 1. Remove the session (independent lock, always acquired first).
        {
            let mut sessions = self.sessions.write().await;
            if sessions.remove(&connection_id).is_none() {
                return; // Already removed
            }
        }

        // 2. Collect the rooms this connection was joined to.
        let joined = {
            let conn_rooms = self.connection_rooms.read().await;
            conn_rooms.get(&connection_id).cloned()
        };

        // 3. Remove from rooms first (consistent with join/leave).
        if let Some(ref joined) = joined {
            let mut rooms = self.rooms.write().await;
            for chat_id in joined {
                if let Some(members) = rooms.get_mut(chat_id) {
                    members.remove(&connection_id);
                    if members.is_empty() {
                        rooms.remove(chat_id);
                    }
                }
            }
        }

        // 4. Remove the reverse mapping last.
        if joined.is_some() {
            let mut conn_rooms = self.connection_rooms.write().await;
            conn_rooms.remove(&connection_id);
        }
    }

    /// Joins a connection to a chat room. Idempotent; a no-op for
    /// connections that are no longer registered.
    ///
    /// A disconnect sweep can race this: `remove_connection` drops the
    /// session first and sweeps memberships after, so if the sweep read the
    /// maps before our inserts landed, the session is already gone by the
    /// time we re-check, and the undo below clears what the sweep missed.
    /// Either way no membership survives for a dead connection.
    pub async fn join(&self, connection_id: Uuid, chat_id: String) {
        {
            let sessions = self.sessions.read().await;
            if !sessions.contains_key(&connection_id) {
                return;
            }
        }

        {
            let mut rooms = self.rooms.write().await;
            rooms.entry(chat_id.clone()).or_default().insert(connection_id);
        }
        {
            let mut conn_rooms = self.connection_rooms.write().await;
            conn_rooms
                .entry(connection_id)
                .or_default()
                .insert(chat_id.clone());
        }

        let still_live = self.sessions.read().await.contains_key(&connection_id);
        if !still_live {
            self.leave(connection_id, &chat_id).await;
        }
    }

    /// True when the connection is currently subscribed to the chat's room.
    pub async fn is_in_room(&self, connection_id: Uuid, chat_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(chat_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    /// Chat ids the connection is currently subscribed to.
    pub async fn joined_rooms(&self, connection_id: Uuid) -> HashSet<String> {
        let conn_rooms = self.connection_rooms.read().await;
        conn_rooms.get(&connection_id).cloned().unwrap_or_default()
    }

    /// Removes a connection from a chat room. Idempotent, including when the
    /// connection was never a member.
    pub async fn leave(&self, connection_id: Uuid, chat_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(chat_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                rooms.remove(chat_id);
            }
        }

        let mut conn_rooms = self.connection_rooms.write().await;
        if let Some(joined) = conn_rooms.get_mut(&connection_id) {
            joined.remove(chat_id);
            if joined.is_empty() {
                conn_rooms.remove(&connection_id);
            }
        }
    }

    /// Broadcasts an event string to every connection in a chat's room, and
    /// only those connections. Best-effort immediate: a full outbound buffer
    /// drops the event for that connection.
    pub async fn broadcast_room(&self, chat_id: &str, event_json: String) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(chat_id) {
            let sessions = self.sessions.read().await;
            for connection_id in members {
                if let Some(session) = sessions.get(connection_id) {
                    if let Err(e) = session.sender.try_send(event_json.clone()) {
                        tracing::warn!(
                            connection_id = %connection_id,
                            chat_id = %chat_id,
                            "dropping room broadcast for slow consumer: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    /// Broadcasts an event string to every live connection.
    pub async fn broadcast_all(&self, event_json: String) {
        let sessions = self.sessions.read().await;
        for (connection_id, session) in sessions.iter() {
            if let Err(e) = session.sender.try_send(event_json.clone()) {
                tracing::warn!(
                    connection_id = %connection_id,
                    "dropping broadcast for slow consumer: {}",
                    e
                );
            }
        }
    }

    /// Returns the current presence snapshot: one entry per distinct online
    /// user id. When a user holds several connections, the last session
    /// visited wins; their profile fields come from the same verified token,
    /// so the collapse is harmless.
    pub async fn presence_snapshot(&self) -> BTreeMap<String, PresenceUser> {
        let sessions = self.sessions.read().await;
        let mut users = BTreeMap::new();
        for session in sessions.values() {
            users.insert(session.identity.user_id.clone(), session.identity.clone());
        }
        users
    }

    /// Returns the send lock for a chat, creating it on first use.
    ///
    /// Locks no in-flight send is holding (the map owns the only `Arc`) are
    /// swept here, so the map tracks active chats rather than every chat
    /// ever posted to.
    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(chat_id.to_string()).or_default().clone()
    }
}

/// Serializes the current presence snapshot and sends it to every
/// connection. Called on each connect and disconnect.
pub async fn broadcast_presence(state: &Arc<AppState>) {
    let users = state.connection_manager.presence_snapshot().await;
    match serde_json::to_string(&ServerEvent::Presence { users }) {
        Ok(json) => state.connection_manager.broadcast_all(json).await,
        Err(e) => tracing::error!("failed to serialize presence snapshot: {}", e),
    }
}

/// Result of a chat membership check against the durable store.
enum MembershipResult {
    /// The user is a confirmed member.
    Allowed,
    /// The user is not a member.
    Denied,
    /// An internal error occurred during the check.
    Error(String),
}

/// Checks chat membership via a blocking DB query.
async fn check_membership(
    pool: parley_db::DbPool,
    chat_id: &str,
    user_id: &str,
) -> MembershipResult {
    let cid = chat_id.to_string();
    let uid = user_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| format!("pool error: {}", e))?;
        is_member(&conn, &cid, &uid).map_err(|e| format!("db error: {}", e))
    })
    .await;

    match result {
        Ok(Ok(true)) => MembershipResult::Allowed,
        Ok(Ok(false)) => MembershipResult::Denied,
        Ok(Err(e)) => MembershipResult::Error(e),
        Err(e) => MembershipResult::Error(format!("task join error: {}", e)),
    }
}

/// WebSocket handler: `GET /ws?token=<access token>`.
///
/// The token is verified before the upgrade completes; a connection that
/// fails verification is refused with `401` and no event handler ever runs
/// for it. Identity comes entirely from the verified claims.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let Some(ref token) = params.token else {
        tracing::warn!(remote_addr = %addr, "websocket connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match parley_auth::verify_access_token(&state.jwt_secret, token) {
        Ok(claims) => {
            tracing::info!(user_id = %claims.sub, remote_addr = %addr, "websocket auth success");
            let identity = PresenceUser {
                user_id: claims.sub,
                name: claims.name,
                avatar_url: claims.avatar_url,
            };
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        }
        Err(e) => {
            tracing::warn!(remote_addr = %addr, error = %e, "websocket auth failed");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Handles one WebSocket connection from admission to close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: PresenceUser) {
    let user_id = identity.user_id.clone();
    let (mut sender, mut receiver) = socket.split();

    // Bounded outbound channel per connection so a slow consumer cannot grow
    // memory without limit; beyond 256 buffered events, events are dropped.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let connection_id = state.connection_manager.add_connection(identity, tx).await;

    // Forward outbound events from the channel to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Everyone, including the new connection, gets the updated snapshot.
    broadcast_presence(&state).await;

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            AxumMessage::Text(text) => {
                let Ok(event) = serde_json::from_str::<ClientEvent>(&text) else {
                    tracing::warn!(user_id = %user_id, "ignoring malformed WebSocket event");
                    continue;
                };
                match event {
                    ClientEvent::Join { chat_id } => {
                        // Join is gated on durable-store membership so a
                        // non-member cannot passively observe a room.
                        match check_membership(state.pool.clone(), &chat_id, &user_id).await {
                            MembershipResult::Allowed => {
                                state.connection_manager.join(connection_id, chat_id).await;
                            }
                            MembershipResult::Denied => {
                                tracing::debug!(
                                    user_id = %user_id,
                                    chat_id = %chat_id,
                                    "dropping join from non-member"
                                );
                            }
                            MembershipResult::Error(e) => {
                                tracing::error!(
                                    user_id = %user_id,
                                    chat_id = %chat_id,
                                    "join membership check failed: {}",
                                    e
                                );
                            }
                        }
                    }
                    ClientEvent::Leave { chat_id } => {
                        state.connection_manager.leave(connection_id, &chat_id).await;
                    }
                    ClientEvent::Message { chat_id, text } => {
                        handle_send(&state, connection_id, &chat_id, &text).await;
                    }
                }
            }
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    state.connection_manager.remove_connection(connection_id).await;
    send_task.abort();

    // The departed connection is gone from the snapshot; a user with other
    // live connections stays present.
    broadcast_presence(&state).await;
}

/// Handles a `chat:message` event: validate, authorize, persist, fan out.
///
/// Fire-and-forget from the sender's perspective. Validation and
/// authorization failures drop the event without feedback on the live
/// channel (fail closed, fail silent); store failures are logged and never
/// produce a broadcast for a message that did not persist.
pub async fn handle_send(state: &Arc<AppState>, connection_id: Uuid, chat_id: &str, text: &str) {
    // 1. Empty or all-whitespace text is a no-op.
    if text.trim().is_empty() {
        tracing::debug!(connection_id = %connection_id, "dropping empty message");
        return;
    }

    // 2. The sending identity must still be registered.
    let Some(identity) = state.connection_manager.identity(connection_id).await else {
        tracing::debug!(connection_id = %connection_id, "dropping message from unknown connection");
        return;
    };

    // 3. Durable-store membership is the sole authorization gate for posting.
    match check_membership(state.pool.clone(), chat_id, &identity.user_id).await {
        MembershipResult::Allowed => {}
        MembershipResult::Denied => {
            tracing::debug!(
                user_id = %identity.user_id,
                chat_id = %chat_id,
                "dropping message from non-member"
            );
            return;
        }
        MembershipResult::Error(e) => {
            tracing::error!(
                user_id = %identity.user_id,
                chat_id = %chat_id,
                "message membership check failed: {}",
                e
            );
            return;
        }
    }

    // 4.-6. Persist, touch the chat, broadcast — under the chat's send lock
    // so broadcast order matches persisted order within the room.
    let lock = state.connection_manager.chat_lock(chat_id).await;
    let _guard = lock.lock().await;

    let params = CreateMessageParams {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        sender_id: identity.user_id.clone(),
        body: text.to_string(),
    };

    let pool = state.pool.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let message = create_message(&conn, &params).map_err(|e| e.to_string())?;
        touch_chat(&conn, &message.chat_id).map_err(|e| e.to_string())?;
        Ok::<_, String>(message)
    })
    .await;

    let message = match result {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            tracing::error!(
                user_id = %identity.user_id,
                chat_id = %chat_id,
                "failed to persist message: {}",
                e
            );
            return;
        }
        Err(e) => {
            tracing::error!(
                user_id = %identity.user_id,
                chat_id = %chat_id,
                "message persist task failed: {}",
                e
            );
            return;
        }
    };

    // Use the persisted chat id, not the client-supplied one.
    let room = message.chat_id.clone();
    let event = ServerEvent::Message {
        message: message.into(),
    };
    match serde_json::to_string(&event) {
        Ok(json) => state.connection_manager.broadcast_room(&room, json).await,
        Err(e) => {
            tracing::error!(chat_id = %room, "failed to serialize message broadcast: {}", e);
        }
    }
}
