//! Behavior tests for the message ingress path: validate, authorize,
//! persist, fan out.

use parley_chats::{create_direct_chat, create_user, list_messages, CreateUserParams};
use parley_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use parley_server::api_ws::{handle_send, PresenceUser};
use parley_server::{config::Config, AppState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = "test-signing-secret".to_string();
    config
}

fn setup_state() -> (Arc<AppState>, DbPool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("test.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("mallory", "Mallory")] {
            create_user(
                &conn,
                &CreateUserParams {
                    id: id.to_string(),
                    email: format!("{id}@example.com"),
                    password_hash: None,
                    name: name.to_string(),
                    avatar_url: None,
                },
            )
            .unwrap();
        }
        create_direct_chat(&conn, "chat-ab", "alice", "bob").unwrap();
    }
    (Arc::new(AppState::new(pool.clone(), &test_config())), pool, dir)
}

fn identity(user_id: &str, name: &str) -> PresenceUser {
    PresenceUser {
        user_id: user_id.to_string(),
        name: name.to_string(),
        avatar_url: None,
    }
}

/// Registers a connection and joins it to a room, returning the connection id
/// and the receiving end of its outbound channel.
async fn connect_and_join(
    state: &Arc<AppState>,
    user_id: &str,
    name: &str,
    chat_id: &str,
) -> (Uuid, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(256);
    let connection_id = state
        .connection_manager
        .add_connection(identity(user_id, name), tx)
        .await;
    state
        .connection_manager
        .join(connection_id, chat_id.to_string())
        .await;
    (connection_id, rx)
}

async fn recv_event(rx: &mut mpsc::Receiver<String>) -> Value {
    let raw = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("should receive within timeout")
        .expect("channel should not be closed");
    serde_json::from_str(&raw).expect("events are valid JSON")
}

async fn assert_silent(rx: &mut mpsc::Receiver<String>) {
    let silence = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
    assert!(silence.is_err(), "expected no event, got {:?}", silence);
}

#[tokio::test]
async fn valid_send_persists_then_broadcasts() {
    let (state, pool, _dir) = setup_state();

    let (alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;
    let (_bob_conn, mut bob_rx) = connect_and_join(&state, "bob", "Bob", "chat-ab").await;

    handle_send(&state, alice_conn, "chat-ab", "hello bob").await;

    // Both room members, sender included, receive the event
    for rx in [&mut alice_rx, &mut bob_rx] {
        let event = recv_event(rx).await;
        assert_eq!(event["type"], "chat:message");
        assert_eq!(event["message"]["chatId"], "chat-ab");
        assert_eq!(event["message"]["text"], "hello bob");
        assert_eq!(event["message"]["sender"]["name"], "Alice");
        assert!(event["message"]["id"].as_str().is_some());
        assert!(event["message"]["createdAt"].as_str().is_some());
    }

    // The broadcast id matches a persisted row
    let conn = pool.get().unwrap();
    let stored = list_messages(&conn, "chat-ab", None).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body, "hello bob");
    assert_eq!(stored[0].sender_id, "alice");
}

#[tokio::test]
async fn empty_text_is_dropped() {
    let (state, pool, _dir) = setup_state();

    let (alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;

    handle_send(&state, alice_conn, "chat-ab", "").await;
    handle_send(&state, alice_conn, "chat-ab", "   \n\t ").await;

    assert_silent(&mut alice_rx).await;
    let conn = pool.get().unwrap();
    assert!(list_messages(&conn, "chat-ab", None).unwrap().is_empty());
}

#[tokio::test]
async fn non_member_send_is_dropped_silently() {
    let (state, pool, _dir) = setup_state();

    let (_alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;
    let (mallory_conn, mut mallory_rx) = {
        let (tx, rx) = mpsc::channel(256);
        let id = state
            .connection_manager
            .add_connection(identity("mallory", "Mallory"), tx)
            .await;
        (id, rx)
    };

    handle_send(&state, mallory_conn, "chat-ab", "let me in").await;

    // Nothing persisted, nothing broadcast, no feedback to the sender
    assert_silent(&mut alice_rx).await;
    assert_silent(&mut mallory_rx).await;
    let conn = pool.get().unwrap();
    assert!(list_messages(&conn, "chat-ab", None).unwrap().is_empty());
}

#[tokio::test]
async fn send_from_unknown_connection_is_noop() {
    let (state, pool, _dir) = setup_state();

    handle_send(&state, Uuid::new_v4(), "chat-ab", "ghost message").await;

    let conn = pool.get().unwrap();
    assert!(list_messages(&conn, "chat-ab", None).unwrap().is_empty());
}

#[tokio::test]
async fn broadcast_stays_within_the_room() {
    let (state, pool, _dir) = setup_state();
    {
        let conn = pool.get().unwrap();
        create_direct_chat(&conn, "chat-am", "alice", "mallory").unwrap();
    }

    let (alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;
    // Mallory is online and joined to a different room
    let (_m_conn, mut mallory_rx) = connect_and_join(&state, "mallory", "Mallory", "chat-am").await;

    handle_send(&state, alice_conn, "chat-ab", "private").await;

    let event = recv_event(&mut alice_rx).await;
    assert_eq!(event["message"]["text"], "private");
    assert_silent(&mut mallory_rx).await;
}

#[tokio::test]
async fn member_not_joined_to_room_misses_live_event_but_history_has_it() {
    let (state, pool, _dir) = setup_state();

    let (alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;
    // Bob is online but has not joined the room
    let (tx, mut bob_rx) = mpsc::channel(256);
    state
        .connection_manager
        .add_connection(identity("bob", "Bob"), tx)
        .await;

    handle_send(&state, alice_conn, "chat-ab", "anyone there?").await;

    let event = recv_event(&mut alice_rx).await;
    assert_eq!(event["message"]["text"], "anyone there?");
    assert_silent(&mut bob_rx).await;

    // Delivery is room-scoped; durability is not
    let conn = pool.get().unwrap();
    assert_eq!(list_messages(&conn, "chat-ab", None).unwrap().len(), 1);
}

#[tokio::test]
async fn broadcast_order_matches_persisted_order() {
    let (state, pool, _dir) = setup_state();

    let (alice_conn, _alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;
    let (bob_conn, mut bob_rx) = connect_and_join(&state, "bob", "Bob", "chat-ab").await;

    // Interleave sends from two connections concurrently
    let mut handles = Vec::new();
    for i in 0..10 {
        let state = state.clone();
        let sender = if i % 2 == 0 { alice_conn } else { bob_conn };
        handles.push(tokio::spawn(async move {
            handle_send(&state, sender, "chat-ab", &format!("m{i}")).await;
        }));
    }
    for handle in handles {
        handle.await.expect("send task should not panic");
    }

    // Bob observed every message; the order he saw is the order the store
    // returns
    let mut seen = Vec::new();
    for _ in 0..10 {
        let event = recv_event(&mut bob_rx).await;
        seen.push(event["message"]["text"].as_str().unwrap().to_string());
    }

    let conn = pool.get().unwrap();
    let stored: Vec<String> = list_messages(&conn, "chat-ab", None)
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(seen, stored);
}

#[tokio::test]
async fn send_to_unknown_chat_is_dropped() {
    let (state, pool, _dir) = setup_state();

    let (alice_conn, mut alice_rx) = connect_and_join(&state, "alice", "Alice", "chat-ab").await;

    // Membership check fails closed for a chat that does not exist
    handle_send(&state, alice_conn, "no-such-chat", "hello?").await;

    assert_silent(&mut alice_rx).await;
    let conn = pool.get().unwrap();
    assert!(list_messages(&conn, "chat-ab", None).unwrap().is_empty());
}
