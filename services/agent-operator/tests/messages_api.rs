//! Messaging API over a real listener, with agents simulated on an
//! in-memory stream store.

use std::sync::Arc;
use std::time::Duration;

use agentbox_operator::api;
use agentbox_operator::bridge::{MemoryStreamStore, MessageBridge, PollConfig, StreamStore};
use agentbox_operator::cluster::MockCluster;
use agentbox_operator::crd::{Agent, AgentSpec};
use agentbox_operator::state::AppState;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const INBOX: &str = "agent:scout-1:inbox";
const REPLIES: &str = "agent:scout-1:reply";

fn fast_polling() -> PollConfig {
    PollConfig {
        block: Duration::from_millis(200),
        pause: Duration::from_millis(10),
        ..PollConfig::default()
    }
}

fn cluster_with_agent(name: &str) -> Arc<MockCluster> {
    let cluster = Arc::new(MockCluster::new());
    let mut agent = Agent::new(
        name,
        AgentSpec {
            agent_type: "scouting-agent".to_string(),
            image: "scout:latest".to_string(),
            env: vec![],
            run_once: false,
            max_restarts: 5,
            ttl: 0,
            last_activity_time: None,
            input_schema_ref: None,
            output_schema_ref: None,
        },
    );
    agent.metadata.namespace = Some("agent-scouting-agent".to_string());
    cluster.apply_agent(agent);
    cluster
}

async fn serve(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start(store: Option<Arc<MemoryStreamStore>>) -> String {
    let bridge = store.map(|s| MessageBridge::new(s).with_poll_config(fast_polling()));
    serve(AppState::new(cluster_with_agent("scout-1"), bridge)).await
}

/// Answer the next request in the inbox the way a running agent would.
fn spawn_echo_agent(store: Arc<MemoryStreamStore>) {
    tokio::spawn(async move {
        let request = store
            .read_after(INBOX, "0-0", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("no request arrived");
        let payload = request.fields["payload"].clone();
        let sender = request.fields.get("sender").cloned().unwrap_or_default();
        store
            .append(
                REPLIES,
                &[
                    ("result".to_string(), payload),
                    ("sender".to_string(), sender),
                ],
            )
            .await
            .unwrap();
    });
}

#[tokio::test]
async fn test_send_returns_first_reply_after_request() {
    let store = Arc::new(MemoryStreamStore::new());
    // A reply left over from an earlier exchange must not be returned.
    store
        .append(REPLIES, &[("result".to_string(), "stale".to_string())])
        .await
        .unwrap();
    let base = start(Some(store.clone())).await;
    spawn_echo_agent(store.clone());

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/agents/scout-1/messages"))
        .header("X-User-ID", "user-42")
        .json(&json!({ "payload": { "query": "find leads" }, "timeout": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reply"]["result"], r#"{"query":"find leads"}"#);
    assert_eq!(body["reply"]["sender"], "user-42");
    assert!(body["id"].as_str().is_some_and(|id| id != "1-0"));

    let inbox = store.recent(INBOX, 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].fields["sender"], "user-42");
}

#[tokio::test]
async fn test_send_accepts_largest_timeout() {
    let store = Arc::new(MemoryStreamStore::new());
    let base = start(Some(store.clone())).await;
    spawn_echo_agent(store);

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/agents/scout-1/messages"))
        .json(&json!({ "payload": {}, "timeout": i64::MAX }))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reply"]["result"], "{}");
}

#[tokio::test]
async fn test_send_times_out_without_reply() {
    let store = Arc::new(MemoryStreamStore::new());
    let base = start(Some(store.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/agents/scout-1/messages"))
        .header("x-request-id", "req-timeout")
        .json(&json!({ "payload": "ping", "timeout": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/problem+json"
    );

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "reply_timeout");
    assert_eq!(body["request_id"], "req-timeout");
    assert_eq!(body["retryable"], true);

    // The request was still delivered.
    assert_eq!(store.recent(INBOX, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let store = Arc::new(MemoryStreamStore::new());
    let base = start(Some(store.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/agents/nobody/messages"))
        .json(&json!({ "payload": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "agent_not_found");
    assert!(body["request_id"].as_str().is_some_and(|id| id.starts_with("req_")));

    assert!(store.recent("agent:nobody:inbox", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_store_is_unavailable() {
    let base = start(None).await;
    let client = reqwest::Client::new();

    // Checked before the agent lookup and the body.
    let resp = client
        .post(format!("{base}/api/v1/agents/nobody/messages"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "stream_store_unavailable");

    let resp = client
        .get(format!("{base}/api/v1/agents/scout-1/messages"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let resp = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let store = Arc::new(MemoryStreamStore::new());
    let base = start(Some(store.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/agents/scout-1/messages"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_request_body");

    assert!(store.recent(INBOX, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_returns_newest_replies_first() {
    let store = Arc::new(MemoryStreamStore::new());
    for i in 0..15 {
        store
            .append(REPLIES, &[("result".to_string(), format!("r{i}"))])
            .await
            .unwrap();
    }
    let base = start(Some(store)).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/v1/agents/scout-1/messages?limit=3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["values"]["result"], "r14");
    assert_eq!(messages[2]["values"]["result"], "r12");

    // Missing, non-positive and malformed limits fall back to 10.
    for query in ["", "?limit=0", "?limit=-4", "?limit=abc"] {
        let body: Value = client
            .get(format!("{base}/api/v1/agents/scout-1/messages{query}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 10, "query {query:?}");
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let store = Arc::new(MemoryStreamStore::new());
    let base = start(Some(store)).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{base}/livez")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}
