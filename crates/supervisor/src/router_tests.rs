use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::connection::ConnectionManager;
use crate::router::{handler_fn, MessageType};
use crate::test_support::*;
use crate::SupervisorError;

#[tokio::test]
async fn test_broadcast_counts_alive_connections_of_user() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());

    let mut alice = Vec::new();
    for _ in 0..3 {
        let transport = RecordingTransport::new(TransportMode::Deliver);
        alice.push(connections.connect("alice", transport));
    }
    for _ in 0..2 {
        connections.connect("bob", RecordingTransport::new(TransportMode::Deliver));
    }
    connections.mark_dead(&alice[0]);

    let message = json!({"type": "notice", "payload": {}});
    assert_eq!(router.broadcast_message(&message, Some("alice")).await, 2);
    assert_eq!(router.broadcast_message(&message, Some("bob")).await, 2);
    assert_eq!(router.broadcast_message(&message, Some("carol")).await, 0);
    assert_eq!(router.broadcast_message(&message, None).await, 4);
}

#[tokio::test]
async fn test_broadcast_counts_only_successful_deliveries() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());

    connections.connect("alice", RecordingTransport::new(TransportMode::Deliver));
    connections.connect("alice", RecordingTransport::new(TransportMode::Closed));
    connections.connect("alice", RecordingTransport::new(TransportMode::Hang));

    let delivered = router
        .broadcast_message(&json!({"type": "notice"}), Some("alice"))
        .await;
    assert_eq!(delivered, 1);
    // failed sends leave removal to the lifecycle sweep
    assert_eq!(connections.len(), 3);
}

#[tokio::test]
async fn test_dispatches_to_registered_handler() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let transport = RecordingTransport::new(TransportMode::Deliver);
    let connection_id = connections.connect("alice", transport.clone());

    let pong_router = router.clone();
    router.register_message_handler(
        MessageType::Ping,
        handler_fn(move |ctx| {
            let router = pong_router.clone();
            async move {
                assert_eq!(ctx.user_id, "alice");
                router
                    .send_message(&ctx.connection_id, &json!({"type": "pong"}))
                    .await;
                Ok(())
            }
        }),
    );

    assert!(
        router
            .handle_message(&connection_id, r#"{"type": "ping", "payload": {}}"#)
            .await
    );
    assert_eq!(transport.sent_json(), vec![json!({"type": "pong"})]);
    assert_eq!(connections.get(&connection_id).unwrap().messages_received, 1);
}

#[tokio::test]
async fn test_unknown_type_uses_fallback_handler() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let connection_id =
        connections.connect("alice", RecordingTransport::new(TransportMode::Deliver));

    assert!(
        !router
            .handle_message(&connection_id, r#"{"type": "dance"}"#)
            .await
    );

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    router.register_fallback_handler(handler_fn(move |ctx| {
        let counter = counter.clone();
        async move {
            assert_eq!(ctx.message_type, MessageType::Unknown("dance".to_string()));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    assert!(
        router
            .handle_message(&connection_id, r#"{"type": "dance"}"#)
            .await
    );
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_later_registration_replaces_handler() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let connection_id =
        connections.connect("alice", RecordingTransport::new(TransportMode::Deliver));

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    for counter in [first.clone(), second.clone()] {
        router.register_message_handler(
            MessageType::StopAgent,
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
    }

    router
        .handle_message(&connection_id, r#"{"type": "stop_agent"}"#)
        .await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejects_unknown_and_dead_connections() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    router.register_fallback_handler(handler_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    assert!(!router.handle_message("conn_missing", r#"{"type": "ping"}"#).await);

    let connection_id =
        connections.connect("alice", RecordingTransport::new(TransportMode::Deliver));
    connections.mark_dead(&connection_id);
    assert!(!router.handle_message(&connection_id, r#"{"type": "ping"}"#).await);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_and_failing_messages_report_errors() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let transport = RecordingTransport::new(TransportMode::Deliver);
    let connection_id = connections.connect("alice", transport.clone());

    router.register_message_handler(
        MessageType::StartAgent,
        handler_fn(|_| async { Err(SupervisorError::Validation("missing input".to_string())) }),
    );

    assert!(!router.handle_message(&connection_id, "not json").await);
    assert!(
        !router
            .handle_message(&connection_id, r#"{"type": "start_agent"}"#)
            .await
    );

    let sent = transport.sent_json();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["type"], "error");
    assert_eq!(sent[0]["payload"]["code"], "invalid_message");
    assert_eq!(sent[1]["payload"]["code"], "handler_error");
}

#[tokio::test]
async fn test_slow_transport_times_out_without_removal() {
    let connections = Arc::new(ConnectionManager::new());
    let router = router(connections.clone());
    let connection_id = connections.connect("alice", RecordingTransport::new(TransportMode::Hang));

    let sent = router
        .send_message(&connection_id, &json!({"type": "notice"}))
        .await;

    assert!(!sent);
    let info = connections.get(&connection_id).unwrap();
    assert!(info.alive);
    assert_eq!(info.messages_sent, 0);
}
