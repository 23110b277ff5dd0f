use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use supervisor::{
    AgentExecutionError, AgentResponse, AgentService, AlertThreshold, ChannelTransport,
    InMemoryThreadService, SupervisorEvent,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::{AppState, config::ServerConfig, middleware::REQUEST_ID_HEADER, routes};

/// Answers every agent with its own name; `forbidden` agents fail terminally
struct EchoAgents {
    forbidden: Vec<&'static str>,
}

#[async_trait]
impl AgentService for EchoAgents {
    async fn execute_agent(
        &self,
        agent_name: &str,
        _thread_id: Option<&str>,
        _input: &Value,
        _config: &Value,
    ) -> Result<AgentResponse, AgentExecutionError> {
        if self.forbidden.contains(&agent_name) {
            return Err(AgentExecutionError::terminal(
                agent_name,
                "authorization denied by agent service",
            ));
        }
        Ok(AgentResponse {
            run_id: format!("agent_{}", agent_name),
            response: json!({ "agent": agent_name }),
        })
    }
}

fn test_state_with(config: ServerConfig, forbidden: Vec<&'static str>) -> AppState {
    AppState::new(
        config,
        Arc::new(EchoAgents { forbidden }),
        Arc::new(InMemoryThreadService::new()),
    )
}

fn test_state() -> AppState {
    test_state_with(ServerConfig::default(), Vec::new())
}

async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = routes::router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = tokio_test::assert_ok!(serde_json::from_slice::<Value>(&bytes));
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_for_completion(
    rx: &mut tokio::sync::broadcast::Receiver<SupervisorEvent>,
    flow_id: &str,
) -> SupervisorEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if event.flow_id == flow_id && event.is_terminal() {
            return event;
        }
    }
}

/// Read outbound socket messages until every wanted type has been seen
async fn read_until(outbound: &mut mpsc::Receiver<String>, wanted: &[&str]) -> Vec<Value> {
    let mut messages = Vec::new();
    loop {
        let text = tokio::time::timeout(Duration::from_secs(10), outbound.recv())
            .await
            .expect("socket stalled")
            .expect("socket closed");
        messages.push(serde_json::from_str::<Value>(&text).unwrap());
        let seen_all = wanted
            .iter()
            .all(|t| messages.iter().any(|m| m["type"] == *t));
        if seen_all {
            return messages;
        }
    }
}

#[tokio::test]
async fn test_health_reports_ok() {
    let state = test_state();
    let (status, body) = call(&state, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["active_runs"], 0);
}

#[tokio::test]
async fn test_metrics_are_exported_as_text() {
    let state = test_state();
    let response = routes::router(state)
        .oneshot(get("/api/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_flow_is_not_found() {
    let state = test_state();
    let (status, body) = call(&state, get("/api/flows/flow_missing")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let response = routes::router(state)
        .oneshot(get("/api/flows/flow_missing/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_run_rejects_blank_user() {
    let state = test_state();
    let (status, body) = call(
        &state,
        post_json("/api/runs", json!({ "user_id": " ", "input": "hi" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("user_id"));
}

#[tokio::test]
async fn test_http_run_completes_and_flow_is_released() {
    let state = test_state();
    let mut events = state.engine.broadcaster().subscribe();

    let request = Request::builder()
        .method("POST")
        .uri("/api/runs")
        .header("content-type", "application/json")
        .header(REQUEST_ID_HEADER, "req-http-1")
        .body(Body::from(
            json!({ "user_id": "alice", "input": { "message": "cut my model costs" } })
                .to_string(),
        ))
        .unwrap();
    let (status, body) = call(&state, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["request_id"], "req-http-1");
    assert!(body["data"]["thread_id"].is_string());
    let flow_id = body["data"]["flow_id"].as_str().unwrap().to_string();

    let completed = wait_for_completion(&mut events, &flow_id).await;
    let envelope = serde_json::to_value(&completed).unwrap();
    assert_eq!(envelope["status"], "success");

    // the flow is dropped right after the terminal event goes out
    for _ in 0..100 {
        if !state.engine.flows().contains(&flow_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, _) = call(&state, get(&format!("/api/flows/{}", flow_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_unknown_run_is_not_found() {
    let state = test_state();
    let (status, _) = call(&state, post_json("/api/runs/run_nope/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_connections_route_lists_registered_sockets() {
    let state = test_state();
    let (transport, _outbound) = ChannelTransport::channel(8);
    let connection_id = state.connections.connect("alice", Arc::new(transport));

    let (status, body) = call(&state, get("/api/connections")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stats"]["alive_connections"], 1);
    assert_eq!(body["data"]["connections"][0]["connection_id"], connection_id);
}

#[tokio::test]
async fn test_alerts_can_be_listed_and_resolved() {
    let state = test_state();
    state.monitor.evaluate("run_failure_rate", 0.5).await;

    let (_, body) = call(&state, get("/api/alerts")).await;
    assert_eq!(body["data"][0]["metric_name"], "run_failure_rate");
    assert_eq!(body["data"][0]["severity"], "critical");

    let (status, _) = call(
        &state,
        post_json("/api/alerts/run_failure_rate/resolve", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &state,
        post_json("/api/alerts/run_failure_rate/resolve", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_socket_ping_and_unknown_type() {
    let state = test_state();
    let (transport, mut outbound) = ChannelTransport::channel(8);
    let connection_id = state.connections.connect("alice", Arc::new(transport));
    let router = state.engine.router();

    assert!(router.handle_message(&connection_id, r#"{"type": "ping"}"#).await);
    let pong: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(pong["type"], "pong");

    assert!(router.handle_message(&connection_id, r#"{"type": "dance"}"#).await);
    let error: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "unknown_message_type");
}

#[tokio::test]
async fn test_socket_start_agent_streams_progress_to_sender() {
    let state = test_state();
    let (transport, mut outbound) = ChannelTransport::channel(256);
    let connection_id = state.connections.connect("alice", Arc::new(transport));

    let handled = state
        .engine
        .router()
        .handle_message(
            &connection_id,
            r#"{"type": "start_agent", "payload": {"message": "why are my requests failing"}}"#,
        )
        .await;
    assert!(handled);

    let messages = read_until(&mut outbound, &["agent_started", "agent_completed"]).await;
    let started = &messages[0];
    assert_eq!(started["type"], "agent_started");
    let flow_id = started["payload"]["flow_id"].as_str().unwrap();

    let types: Vec<&str> = messages
        .iter()
        .filter(|m| m["flow_id"] == flow_id)
        .filter_map(|m| m["type"].as_str())
        .collect();
    assert_eq!(types.first(), Some(&"supervisor_flow"));
    assert!(types.contains(&"supervisor_parallel"));
    assert!(types.contains(&"supervisor_decision"));
    let completed = messages
        .iter()
        .find(|m| m["type"] == "agent_completed")
        .unwrap();
    assert_eq!(completed["status"], "success");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_started_is_the_first_message_of_each_run() {
    let state = test_state();

    for _ in 0..50 {
        let (transport, mut outbound) = ChannelTransport::channel(256);
        let connection_id = state.connections.connect("alice", Arc::new(transport));

        assert!(
            state
                .engine
                .router()
                .handle_message(
                    &connection_id,
                    r#"{"type": "start_agent", "payload": {"message": "cost report"}}"#,
                )
                .await
        );

        let text = tokio::time::timeout(Duration::from_secs(10), outbound.recv())
            .await
            .expect("socket stalled")
            .expect("socket closed");
        let first: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(first["type"], "agent_started");
        assert!(first["payload"]["flow_id"].is_string());

        let rest = read_until(&mut outbound, &["agent_completed"]).await;
        assert!(
            rest.iter()
                .filter(|m| m["type"] != "agent_started")
                .all(|m| m["flow_id"] == first["payload"]["flow_id"])
        );
    }
}

#[tokio::test]
async fn test_health_counts_connection_sends() {
    let state = test_state();
    let (transport, mut outbound) = ChannelTransport::channel(8);
    let connection_id = state.connections.connect("alice", Arc::new(transport));

    assert!(
        state
            .engine
            .router()
            .handle_message(&connection_id, r#"{"type": "ping"}"#)
            .await
    );
    outbound.recv().await.unwrap();

    let (status, body) = call(&state, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reliability"]["succeeded"], 1);
}

#[tokio::test]
async fn test_socket_terminal_agent_error_reports_failure() {
    let state = test_state_with(ServerConfig::default(), vec!["triage"]);
    let (transport, mut outbound) = ChannelTransport::channel(256);
    let connection_id = state.connections.connect("alice", Arc::new(transport));

    state
        .engine
        .router()
        .handle_message(
            &connection_id,
            r#"{"type": "start_agent", "payload": {"input": {"query": "costs"}}}"#,
        )
        .await;

    let messages = read_until(&mut outbound, &["agent_started", "agent_completed"]).await;
    let completed = messages
        .iter()
        .find(|m| m["type"] == "agent_completed")
        .unwrap();
    assert_eq!(completed["status"], "error");
    assert!(completed["error"].as_str().unwrap().contains("authorization"));
    assert!(!messages.iter().any(|m| m["type"] == "supervisor_retry"));
    assert!(!messages.iter().any(|m| m["type"] == "supervisor_fallback"));
}

#[tokio::test]
async fn test_socket_cannot_stop_another_users_run() {
    let state = test_state();
    let (alice_transport, _alice_out) = ChannelTransport::channel(256);
    let (bob_transport, mut bob_out) = ChannelTransport::channel(256);
    let alice = state.connections.connect("alice", Arc::new(alice_transport));
    let bob = state.connections.connect("bob", Arc::new(bob_transport));

    let handle = state
        .engine
        .start_run(supervisor::RunRequest::new("alice", json!("hello")).with_connection(alice))
        .await
        .unwrap();
    let payload = json!({ "type": "stop_agent", "payload": { "run_id": handle.run_id() } });

    let handled = state
        .engine
        .router()
        .handle_message(&bob, &payload.to_string())
        .await;

    assert!(!handled);
    let error: Value = serde_json::from_str(&bob_out.recv().await.unwrap()).unwrap();
    assert_eq!(error["payload"]["code"], "handler_error");
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_socket_get_flow_state_requires_an_id() {
    let state = test_state();
    let (transport, mut outbound) = ChannelTransport::channel(8);
    let connection_id = state.connections.connect("alice", Arc::new(transport));

    let handled = state
        .engine
        .router()
        .handle_message(&connection_id, r#"{"type": "get_flow_state", "payload": {}}"#)
        .await;

    assert!(!handled);
    let error: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(error["payload"]["code"], "handler_error");
}

#[tokio::test]
async fn test_heartbeat_sweeps_dead_connections_and_tracks_alerts() {
    let mut config = ServerConfig::default();
    config.supervisor.alert_thresholds = vec![AlertThreshold::new("active_connections", 1.0, 10.0)];
    let state = test_state_with(config, Vec::new());

    let (live, _live_out) = ChannelTransport::channel(8);
    let (dead, _dead_out) = ChannelTransport::channel(8);
    let live_id = state.connections.connect("alice", Arc::new(live));
    let dead_id = state.connections.connect("bob", Arc::new(dead));
    state.connections.mark_dead(&dead_id);

    state.heartbeat().await;

    assert!(state.connections.get(&dead_id).is_none());
    assert!(state.connections.get(&live_id).is_some());
    let active = state.monitor.active_alerts().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].metric_name, "active_connections");

    state.connections.disconnect(&live_id);
    state.heartbeat().await;
    assert!(state.monitor.active_alerts().await.is_empty());
}
