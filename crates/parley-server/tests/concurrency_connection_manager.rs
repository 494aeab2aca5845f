//! Concurrency tests for the WebSocket ConnectionManager.
//!
//! These tests verify that the ConnectionManager correctly handles
//! concurrent join/leave/remove_connection operations without deadlocks,
//! data corruption, or orphaned entries.

use parley_server::api_ws::{ConnectionManager, PresenceUser};
use std::sync::Arc;
use tokio::sync::mpsc;

fn identity(user_id: &str) -> PresenceUser {
    PresenceUser {
        user_id: user_id.to_string(),
        name: user_id.to_string(),
        avatar_url: None,
    }
}

/// Helper to create a connection sender that won't be used for actual
/// messaging.
fn dummy_sender() -> mpsc::Sender<String> {
    mpsc::channel::<String>(1).0
}

#[tokio::test]
async fn concurrent_join_leave_no_deadlock() {
    let cm = ConnectionManager::new();

    let mut connections = Vec::new();
    for i in 0..10 {
        connections.push(
            cm.add_connection(identity(&format!("user_{i}")), dummy_sender())
                .await,
        );
    }

    // Spawn 100 concurrent join + leave tasks across 5 rooms
    let cm = Arc::new(cm);
    let mut handles = Vec::new();

    for i in 0..100 {
        let cm = cm.clone();
        let connection_id = connections[i % 10];
        let chat_id = format!("chat_{}", i % 5);

        handles.push(tokio::spawn(async move {
            cm.join(connection_id, chat_id.clone()).await;
            // Immediately leave to stress the lock ordering
            cm.leave(connection_id, &chat_id).await;
        }));
    }

    // All tasks must complete without deadlock
    for handle in handles {
        handle.await.expect("task should not panic");
    }
}

#[tokio::test]
async fn concurrent_remove_and_join_no_orphans() {
    let cm = ConnectionManager::new();

    let connection_id = cm.add_connection(identity("user_a"), dummy_sender()).await;
    cm.join(connection_id, "ch1".to_string()).await;
    cm.join(connection_id, "ch2".to_string()).await;
    cm.join(connection_id, "ch3".to_string()).await;

    // Concurrently: remove the connection while joining more rooms
    let cm = Arc::new(cm);
    let cm1 = cm.clone();
    let cm2 = cm.clone();

    let remove_handle = tokio::spawn(async move {
        cm1.remove_connection(connection_id).await;
    });

    let join_handle = tokio::spawn(async move {
        cm2.join(connection_id, "ch4".to_string()).await;
        cm2.join(connection_id, "ch5".to_string()).await;
    });

    remove_handle.await.expect("remove should not panic");
    join_handle.await.expect("join should not panic");

    // However the race resolved, the connection is gone and no membership
    // survives it in either direction of the registry.
    assert!(cm.identity(connection_id).await.is_none());
    for chat_id in ["ch1", "ch2", "ch3", "ch4", "ch5"] {
        assert!(
            !cm.is_in_room(connection_id, chat_id).await,
            "removed connection must not linger in {chat_id}"
        );
    }
    assert!(
        cm.joined_rooms(connection_id).await.is_empty(),
        "removed connection must hold no subscriptions"
    );

    // After removal + possible re-join, broadcasting should not panic
    cm.broadcast_room("ch1", "test".to_string()).await;
    cm.broadcast_room("ch4", "test".to_string()).await;
}

#[tokio::test]
async fn multiple_connections_per_user_share_presence() {
    let cm = ConnectionManager::new();

    // Two tabs for the same user, one for another
    let tab1 = cm.add_connection(identity("alice"), dummy_sender()).await;
    let _tab2 = cm.add_connection(identity("alice"), dummy_sender()).await;
    let _bob = cm.add_connection(identity("bob"), dummy_sender()).await;

    let snapshot = cm.presence_snapshot().await;
    assert_eq!(snapshot.len(), 2, "one entry per distinct user");
    assert!(snapshot.contains_key("alice"));
    assert!(snapshot.contains_key("bob"));

    // Closing one of alice's tabs keeps her present
    cm.remove_connection(tab1).await;
    let snapshot = cm.presence_snapshot().await;
    assert!(snapshot.contains_key("alice"));

    // Bob's only connection leaving drops him
    cm.remove_connection(_bob).await;
    let snapshot = cm.presence_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot.contains_key("bob"));
}

#[tokio::test]
async fn concurrent_broadcast_with_join_leave() {
    let cm = Arc::new(ConnectionManager::new());

    // Set up 20 connections, each joined to "live_chat"
    let mut connections = Vec::new();
    for i in 0..20 {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let connection_id = cm.add_connection(identity(&format!("user_{i}")), tx).await;
        cm.join(connection_id, "live_chat".to_string()).await;
        connections.push(connection_id);
        // Spawn a drain task so the channel doesn't fill up
        tokio::spawn(async move {
            while let Some(_msg) = rx.recv().await {}
        });
    }

    let mut handles = Vec::new();

    // Spawn 50 concurrent broadcast tasks
    for i in 0..50 {
        let cm = cm.clone();
        handles.push(tokio::spawn(async move {
            cm.broadcast_room("live_chat", format!(r#"{{"seq":{i}}}"#))
                .await;
        }));
    }

    // Spawn concurrent join/leave during broadcasts
    for connection_id in connections {
        let cm = cm.clone();
        handles.push(tokio::spawn(async move {
            cm.leave(connection_id, "live_chat").await;
            cm.join(connection_id, "live_chat".to_string()).await;
        }));
    }

    for handle in handles {
        handle
            .await
            .expect("concurrent broadcast + join/leave should not panic");
    }
}

#[tokio::test]
async fn remove_connection_idempotent() {
    let cm = ConnectionManager::new();

    let connection_id = cm.add_connection(identity("user_x"), dummy_sender()).await;
    cm.join(connection_id, "ch1".to_string()).await;

    // Remove twice; the second call is a no-op, not a panic
    cm.remove_connection(connection_id).await;
    cm.remove_connection(connection_id).await;

    // Remove a connection that never existed
    cm.remove_connection(uuid::Uuid::new_v4()).await;
}

#[tokio::test]
async fn join_after_removal_is_noop() {
    let cm = ConnectionManager::new();

    let connection_id = cm.add_connection(identity("user_y"), dummy_sender()).await;
    cm.remove_connection(connection_id).await;

    // A join racing with disconnect cleanup must not resurrect state
    cm.join(connection_id, "ghost_chat".to_string()).await;
    assert!(cm.identity(connection_id).await.is_none());
}

#[tokio::test]
async fn broadcast_to_empty_room_is_noop() {
    let cm = ConnectionManager::new();

    // Broadcasting to a room with no members should not panic
    cm.broadcast_room("empty_chat", "hello".to_string()).await;
}

#[tokio::test]
async fn broadcast_room_reaches_members_only() {
    let cm = ConnectionManager::new();

    let (tx_a, mut rx_a) = mpsc::channel::<String>(16);
    let (tx_b, mut rx_b) = mpsc::channel::<String>(16);
    let conn_a = cm.add_connection(identity("alice"), tx_a).await;
    let _conn_b = cm.add_connection(identity("bob"), tx_b).await;

    cm.join(conn_a, "room".to_string()).await;

    cm.broadcast_room("room", "ping".to_string()).await;

    let msg = tokio::time::timeout(std::time::Duration::from_millis(100), rx_a.recv())
        .await
        .expect("member should receive within timeout")
        .expect("channel should not be closed");
    assert_eq!(msg, "ping");

    // Bob never joined the room and must receive nothing
    let silence = tokio::time::timeout(std::time::Duration::from_millis(50), rx_b.recv()).await;
    assert!(silence.is_err(), "non-member must not receive room events");
}

#[tokio::test]
async fn join_leave_cleans_up_empty_sets() {
    let cm = ConnectionManager::new();

    let conn_a = cm.add_connection(identity("user_a"), dummy_sender()).await;

    cm.join(conn_a, "temp_chat".to_string()).await;

    // Leave should clean up the empty room entry
    cm.leave(conn_a, "temp_chat").await;

    // Re-joining should work fine (room set was properly removed)
    cm.join(conn_a, "temp_chat".to_string()).await;

    // Verify broadcast still works
    let (tx, mut rx) = mpsc::channel::<String>(16);
    let conn_b = cm.add_connection(identity("user_b"), tx).await;
    cm.join(conn_b, "temp_chat".to_string()).await;

    cm.broadcast_room("temp_chat", "ping".to_string()).await;

    let msg = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
        .await
        .expect("should receive within timeout")
        .expect("channel should not be closed");
    assert_eq!(msg, "ping");
}

#[tokio::test]
async fn broadcast_all_reaches_every_connection() {
    let cm = ConnectionManager::new();

    let (tx_a, mut rx_a) = mpsc::channel::<String>(16);
    let (tx_b, mut rx_b) = mpsc::channel::<String>(16);
    cm.add_connection(identity("alice"), tx_a).await;
    cm.add_connection(identity("bob"), tx_b).await;

    cm.broadcast_all("snapshot".to_string()).await;

    for rx in [&mut rx_a, &mut rx_b] {
        let msg = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
            .await
            .expect("should receive within timeout")
            .expect("channel should not be closed");
        assert_eq!(msg, "snapshot");
    }
}
