//! Tests for inbound message handling on a slave connection.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use outpost_proto::{
    Envelope, ErrorPayload, MasterToolsPayload, MessageType, RegisterAck, Tool, ToolCallResponse,
};

use crate::registry::ConnectionHandle;
use crate::server::AppState;
use crate::server::session::SlaveSession;
use crate::server::test_helpers::{pair_slave, test_state, test_state_with};
use crate::storage::{MasterDatabase, SlaveStore};
use crate::upstream::ContextServer;
use crate::upstream::tests::StaticUpstream;

fn session_for(state: &AppState, hostname: &str) -> (SlaveSession, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(32);
    let (handle, _closed) = ConnectionHandle::new(hostname, "01", tx);
    (SlaveSession::new(state.clone(), handle), rx)
}

fn frame(kind: MessageType, id: &str, data: Value) -> String {
    Envelope::new(kind, id, data).to_json().unwrap()
}

fn register_frame(hostname: &str) -> String {
    frame(
        MessageType::Register,
        "reg-1",
        json!({
            "hostname": hostname,
            "version": "2.1.0",
            "tools": [{"name": "search_files", "description": "grep"}],
        }),
    )
}

async fn registered(state: &AppState, db: &MasterDatabase, hostname: &str) -> (SlaveSession, mpsc::Receiver<Envelope>) {
    pair_slave(state, db, hostname).await;
    let (mut session, mut rx) = session_for(state, hostname);
    session.handle_text(&register_frame(hostname)).await;
    // ack, then the master_tools push
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();
    (session, rx)
}

#[tokio::test]
async fn register_connects_acks_and_pushes_master_tools() {
    let mut upstream = StaticUpstream::with_tools(&[
        ("github", "search"),
        ("workstation", "search_files"),
    ]);
    upstream.contexts = vec![(
        "dev".into(),
        vec![
            ContextServer {
                server_name: "github".into(),
                enabled: true,
            },
            ContextServer {
                server_name: "jira".into(),
                enabled: false,
            },
        ],
    )];
    let upstream = Arc::new(upstream);
    let (state, db) = test_state_with(upstream.clone(), upstream).await;
    pair_slave(&state, &db, "workstation").await;
    let (mut session, mut rx) = session_for(&state, "workstation");

    session.handle_text(&register_frame("workstation")).await;
    assert!(session.is_registered());

    let ack = rx.recv().await.unwrap();
    assert_eq!(ack.kind(), Some(MessageType::Response));
    assert_eq!(ack.id, "reg-1");
    assert_eq!(
        ack.payload::<RegisterAck>().unwrap().status,
        "registered"
    );

    let push = rx.recv().await.unwrap();
    assert_eq!(push.kind(), Some(MessageType::MasterTools));
    let tools: MasterToolsPayload = push.payload().unwrap();
    assert_eq!(tools.servers.keys().collect::<Vec<_>>(), vec!["github"]);
    assert_eq!(tools.context_mappings["dev"], vec!["github".to_string()]);

    let snapshot = state.registry.snapshot("workstation").await.unwrap();
    assert_eq!(snapshot.version, "2.1.0");
    assert_eq!(snapshot.tools[0].name, "search_files");

    let stored = db
        .get_slave_server_by_host_id("workstation")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.reported_version, "2.1.0");
    assert!(stored.last_seen.is_some());
}

#[tokio::test]
async fn identity_comes_from_certificate_not_payload() {
    let (state, db) = test_state().await;
    pair_slave(&state, &db, "workstation").await;
    let (mut session, _rx) = session_for(&state, "workstation");

    session.handle_text(&register_frame("laptop")).await;

    assert!(state.registry.is_connected("workstation").await);
    assert!(!state.registry.is_connected("laptop").await);
}

#[tokio::test]
async fn messages_before_register_are_dropped() {
    let (state, _db) = test_state().await;
    let (mut session, mut rx) = session_for(&state, "workstation");

    session
        .handle_text(&frame(MessageType::Heartbeat, "h", Value::Null))
        .await;
    session
        .handle_text(&frame(MessageType::ToolUpdate, "t", json!([])))
        .await;

    assert!(!session.is_registered());
    assert!(!state.registry.is_connected("workstation").await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn invalid_register_gets_error_reply() {
    let (state, _db) = test_state().await;
    let (mut session, mut rx) = session_for(&state, "workstation");

    session
        .handle_text(&frame(MessageType::Register, "reg-1", json!({"tools": "nope"})))
        .await;

    assert!(!session.is_registered());
    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.kind(), Some(MessageType::Error));
    assert_eq!(reply.id, "reg-1");
    assert!(
        reply
            .payload::<ErrorPayload>()
            .unwrap()
            .error
            .contains("invalid register payload")
    );
}

#[tokio::test]
async fn malformed_and_unknown_messages_keep_connection() {
    let (state, db) = test_state().await;
    let (mut session, mut rx) = registered(&state, &db, "workstation").await;

    session.handle_text("{not json").await;
    session
        .handle_text(r#"{"type":"telemetry","id":"x","timestamp":"2026-01-01T00:00:00Z","data":{}}"#)
        .await;
    session
        .handle_text(&frame(MessageType::Restart, "r", Value::Null))
        .await;

    assert!(session.is_registered());
    assert!(state.registry.is_connected("workstation").await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn tool_update_replaces_tools() {
    let (state, db) = test_state().await;
    let (mut session, _rx) = registered(&state, &db, "workstation").await;

    let tools = vec![Tool::new("read_file", ""), Tool::new("write_file", "")];
    session
        .handle_text(&frame(
            MessageType::ToolUpdate,
            "u",
            serde_json::to_value(&tools).unwrap(),
        ))
        .await;
    assert_eq!(state.registry.tool_count("workstation").await, 2);

    // Invalid data leaves the tool set alone.
    session
        .handle_text(&frame(MessageType::ToolUpdate, "u2", json!({"bad": true})))
        .await;
    assert_eq!(state.registry.tool_count("workstation").await, 2);
}

#[tokio::test]
async fn response_resolves_pending_call() {
    let (state, db) = test_state().await;
    let (mut session, mut rx) = registered(&state, &db, "workstation").await;

    let relay = state.relay.clone();
    let call = tokio::spawn(async move {
        relay
            .call_tool("workstation", "search_files", Map::new())
            .await
    });

    let request = rx.recv().await.unwrap();
    assert_eq!(request.kind(), Some(MessageType::ToolCall));
    session
        .handle_text(&frame(
            MessageType::Response,
            &request.id,
            json!({"success": true, "result": {"matches": 3}}),
        ))
        .await;

    assert_eq!(call.await.unwrap().unwrap(), json!({"matches": 3}));
    assert!(state.relay.pending().is_empty());

    // Unmatched ids are dropped quietly.
    session
        .handle_text(&frame(MessageType::Response, "nobody", json!({"success": true})))
        .await;
    assert!(session.is_registered());
}

#[tokio::test]
async fn master_tool_call_replies_with_one_response() {
    let upstream = Arc::new(StaticUpstream::with_tools(&[("github", "search")]));
    let (state, db) = test_state_with(upstream.clone(), upstream.clone()).await;
    let (mut session, mut rx) = registered(&state, &db, "workstation").await;

    session
        .handle_text(&frame(
            MessageType::MasterToolCall,
            "mc-1",
            json!({"server": "github", "tool": "search", "arguments": {"q": "relay"}}),
        ))
        .await;

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.kind(), Some(MessageType::Response));
    assert_eq!(reply.id, "mc-1");
    let body: ToolCallResponse = reply.payload().unwrap();
    assert!(body.success);
    assert_eq!(body.result, Some(json!({"called": "github_search"})));

    let calls = upstream.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["q"], json!("relay"));
}

#[tokio::test]
async fn master_tool_call_failures_are_reported() {
    let upstream = Arc::new(StaticUpstream::default());
    let (state, db) = test_state_with(upstream.clone(), upstream).await;
    let (mut session, mut rx) = registered(&state, &db, "workstation").await;

    session
        .handle_text(&frame(
            MessageType::MasterToolCall,
            "mc-1",
            json!({"server": "github", "tool": "search_fail"}),
        ))
        .await;
    let reply: ToolCallResponse = rx.recv().await.unwrap().payload().unwrap();
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some("tool failed"));

    session
        .handle_text(&frame(MessageType::MasterToolCall, "mc-2", json!({"server": 1})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.id, "mc-2");
    let body: ToolCallResponse = reply.payload().unwrap();
    assert!(!body.success);
}

#[tokio::test]
async fn heartbeat_refreshes_liveness() {
    let (state, db) = test_state().await;
    let (mut session, _rx) = registered(&state, &db, "workstation").await;

    let before = state
        .registry
        .snapshot("workstation")
        .await
        .unwrap()
        .last_heartbeat;
    session
        .handle_text(&frame(MessageType::Heartbeat, "hb", Value::Null))
        .await;
    let after = state
        .registry
        .snapshot("workstation")
        .await
        .unwrap()
        .last_heartbeat;
    assert!(after >= before);
    assert!(
        db.get_slave_server_by_host_id("workstation")
            .await
            .unwrap()
            .unwrap()
            .last_seen
            .is_some()
    );
}
