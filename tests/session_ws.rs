//! Integration tests for the session WebSocket + REST server.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and exercises the real wire protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use agent_runner::agent::{AgentMessage, ExecutionAdapter, ScriptedExecutor};
use agent_runner::config::{DispatchConfig, PoolConfig, QueueConfig, ServerConfig};
use agent_runner::dispatch::Scheduler;
use agent_runner::pool::{LocalProvisioner, WorkerPool};
use agent_runner::session::{AppState, SessionRegistry, router};
use agent_runner::tasks::{TaskFilter, TaskStatus};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start an Axum server on a random port, return (port, scheduler).
async fn start_server(executor: ScriptedExecutor) -> (u16, Arc<Scheduler>) {
    let (queue, queue_rx) = agent_runner::tasks::TaskQueue::new(QueueConfig {
        max_concurrent: 2,
        ..QueueConfig::default()
    });
    let (pool, pool_rx) = WorkerPool::new(
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            ..PoolConfig::default()
        },
        Arc::new(LocalProvisioner::new()),
    );
    pool.initialize().await.unwrap();

    let scheduler = Scheduler::start(
        queue,
        queue_rx,
        pool,
        pool_rx,
        ExecutionAdapter::new(Arc::new(executor)),
        DispatchConfig {
            cancel_grace: Duration::from_millis(200),
        },
    );

    let app = router(AppState {
        scheduler: Arc::clone(&scheduler),
        registry: Arc::new(SessionRegistry::new()),
        config: ServerConfig {
            default_repository: None,
            ..ServerConfig::default()
        },
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, scheduler)
}

fn quick_executor() -> ScriptedExecutor {
    ScriptedExecutor::new(vec![
        AgentMessage::text("looking around"),
        AgentMessage::text("done"),
    ])
    .with_delay(Duration::from_millis(20))
}

fn slow_executor() -> ScriptedExecutor {
    ScriptedExecutor::new(vec![AgentMessage::text("never seen")])
        .with_delay(Duration::from_secs(30))
}

async fn connect(port: u16) -> Ws {
    let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    ws
}

async fn send(ws: &mut Ws, kind: &str, payload: Value) {
    let frame = json!({"id": uuid::Uuid::new_v4().to_string(), "type": kind, "payload": payload});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    let msg = ws.next().await.unwrap().unwrap();
    parse_ws_json(&msg)
}

/// Read frames until one of type `kind` arrives, returning all of them.
async fn read_until(ws: &mut Ws, kind: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_json(ws).await;
        let done = frame["type"] == kind;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ping_gets_pong_envelope() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(&mut ws, "ping", json!({})).await;
        let json = next_json(&mut ws).await;

        assert_eq!(json["type"], "pong");
        assert!(json["id"].is_string());
        assert!(json["timestamp"].is_string());
        assert_eq!(json["payload"], json!({}));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn query_streams_responses_then_complete() {
    timeout(TEST_TIMEOUT, async {
        let (port, scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(
            &mut ws,
            "query",
            json!({
                "prompt": "Fix the flaky test",
                "sessionId": "s-1",
                "options": {"repository": "acme/api", "priority": "high", "maxTurns": 10}
            }),
        )
        .await;

        let frames = read_until(&mut ws, "complete").await;

        assert_eq!(frames[0]["type"], "progress");
        assert_eq!(frames[0]["payload"]["stage"], "queued");
        assert_eq!(frames[0]["payload"]["sessionId"], "s-1");

        let responses: Vec<&Value> = frames.iter().filter(|f| f["type"] == "response").collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["payload"]["content"][0]["text"], "looking around");
        assert_eq!(responses[2]["payload"]["done"], true);

        let complete = &frames.last().unwrap()["payload"];
        assert_eq!(complete["status"], "completed");
        assert_eq!(complete["totalTurns"], 2);
        assert!(complete["duration"].is_u64());

        let tasks = scheduler.queue().list(&TaskFilter::default()).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].repository, "acme/api");
        assert_eq!(tasks[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(slow_executor()).await;
        let mut first = connect(port).await;
        let mut second = connect(port).await;

        let query = json!({"prompt": "p", "sessionId": "shared", "options": {"repository": "r"}});
        send(&mut first, "query", query.clone()).await;
        let queued = next_json(&mut first).await;
        assert_eq!(queued["payload"]["stage"], "queued");

        send(&mut second, "query", query).await;
        let frames = read_until(&mut second, "error").await;
        let error = &frames.last().unwrap()["payload"];
        assert_eq!(error["code"], "INVALID_REQUEST");
        assert_eq!(error["sessionId"], "shared");
        assert_eq!(error["recoverable"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_frames_get_invalid_request() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        ws.send(Message::Text("not json".into())).await.unwrap();
        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "INVALID_REQUEST");
        assert!(json["payload"].get("sessionId").is_none());

        send(&mut ws, "launch_missiles", json!({})).await;
        let json = next_json(&mut ws).await;
        assert_eq!(json["payload"]["code"], "INVALID_REQUEST");

        // Query without a prompt.
        send(&mut ws, "query", json!({"options": {}})).await;
        let json = next_json(&mut ws).await;
        assert_eq!(json["payload"]["code"], "INVALID_REQUEST");

        // Connection stays usable.
        send(&mut ws, "ping", json!({})).await;
        assert_eq!(next_json(&mut ws).await["type"], "pong");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn query_without_repository_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(&mut ws, "query", json!({"prompt": "p", "sessionId": "s-norepo"})).await;
        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "INVALID_REQUEST");
        assert!(scheduler.queue().list(&TaskFilter::default()).await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_unknown_session_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(&mut ws, "cancel", json!({"sessionId": "ghost"})).await;
        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "INVALID_REQUEST");
        assert_eq!(json["payload"]["sessionId"], "ghost");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_ends_session_with_cancelled_complete() {
    timeout(TEST_TIMEOUT, async {
        let (port, scheduler) = start_server(slow_executor()).await;
        let mut ws = connect(port).await;

        send(
            &mut ws,
            "query",
            json!({"prompt": "long job", "sessionId": "s-c", "options": {"repository": "r"}}),
        )
        .await;
        assert_eq!(next_json(&mut ws).await["payload"]["stage"], "queued");

        // Let it start before cancelling.
        while scheduler.queue().running_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        send(&mut ws, "cancel", json!({"sessionId": "s-c"})).await;

        let frames = read_until(&mut ws, "complete").await;
        assert!(frames.iter().all(|f| f["type"] != "response"));
        assert_eq!(frames.last().unwrap()["payload"]["status"], "cancelled");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn configure_sets_working_directory_and_mcp_servers() {
    timeout(TEST_TIMEOUT, async {
        let (port, scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(
            &mut ws,
            "configure",
            json!({
                "apiKey": "sk-test",
                "mcpServers": {"linear": {"command": "linear-mcp"}, "github": {"command": "gh-mcp"}},
                "workingDirectory": "/srv/checkout"
            }),
        )
        .await;
        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "configured");
        assert_eq!(json["payload"]["success"], true);
        assert_eq!(json["payload"]["activeMcpServers"], json!(["github", "linear"]));
        assert_eq!(json["payload"]["workingDirectory"], "/srv/checkout");
        assert!(!json.to_string().contains("sk-test"));

        // The working directory now stands in for a missing repository.
        send(&mut ws, "query", json!({"prompt": "p", "sessionId": "s-wd"})).await;
        read_until(&mut ws, "complete").await;
        let tasks = scheduler.queue().list(&TaskFilter::default()).await;
        assert_eq!(tasks[0].repository, "/srv/checkout");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disconnect_cancels_owned_sessions() {
    timeout(TEST_TIMEOUT, async {
        let (port, scheduler) = start_server(slow_executor()).await;
        let mut ws = connect(port).await;

        send(
            &mut ws,
            "query",
            json!({"prompt": "long job", "sessionId": "s-drop", "options": {"repository": "r"}}),
        )
        .await;
        assert_eq!(next_json(&mut ws).await["payload"]["stage"], "queued");
        drop(ws);

        loop {
            let tasks = scheduler.queue().list(&TaskFilter::default()).await;
            if tasks[0].status == TaskStatus::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_returns_ok() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn task_endpoints_list_and_fetch() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;
        let mut ws = connect(port).await;

        send(
            &mut ws,
            "query",
            json!({"prompt": "p", "sessionId": "s-rest", "options": {"repository": "acme/web"}}),
        )
        .await;
        read_until(&mut ws, "complete").await;

        let tasks: Value = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks?status=completed"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        let id = tasks[0]["id"].as_str().unwrap();

        let task: Value = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks/{id}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(task["repository"], "acme/web");

        let missing = reqwest::get(format!(
            "http://127.0.0.1:{port}/api/tasks/{}",
            uuid::Uuid::new_v4()
        ))
        .await
        .unwrap();
        assert_eq!(missing.status(), 404);

        let bad = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pool_endpoint_reports_workers() {
    timeout(TEST_TIMEOUT, async {
        let (port, _scheduler) = start_server(quick_executor()).await;

        let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/api/pool"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["stats"]["workers"], 1);
        assert_eq!(body["workers"].as_array().unwrap().len(), 1);
        assert_eq!(body["queue"]["maxConcurrent"], 2);
    })
    .await
    .expect("test timed out");
}
