//! WebSocket session server and REST endpoints.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{
    CancelRequest, ClientMessage, ConfigureRequest, ConfiguredPayload, Empty, Envelope,
    ErrorCode, ProgressStage, QueryRequest, ServerMessage,
};
use super::registry::SessionRegistry;
use super::state::{ConnectionId, Session, SessionLink};
use crate::agent::ExecutionOptions;
use crate::config::ServerConfig;
use crate::dispatch::Scheduler;
use crate::tasks::{CancelOutcome, NewTask, TaskFilter};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<SessionRegistry>,
    pub config: ServerConfig,
}

/// Build the Axum router with the session WebSocket and REST routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/pool", get(pool_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-runner"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.config.outbound_buffer.max(1));
    let mut conn = Connection::new(state, outbound_tx);
    info!(connection_id = %conn.id, "WebSocket client connected");

    loop {
        tokio::select! {
            // Session traffic from dispatched tasks
            Some(envelope) = outbound_rx.recv() => {
                if !send_envelope(&mut socket, &envelope).await {
                    debug!(connection_id = %conn.id, "Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let replies = conn.handle_frame(&text).await;
                        let mut open = true;
                        for reply in replies {
                            if !send_envelope(&mut socket, &Envelope::new(reply)).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection_id = %conn.id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %conn.id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    conn.close().await;
    info!(connection_id = %conn.id, "WebSocket connection closed");
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> bool {
    match envelope.to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize outbound frame");
            true
        }
    }
}

/// Per-connection settings applied by `configure`.
#[derive(Default)]
struct Settings {
    api_key: Option<Arc<SecretString>>,
    mcp_servers: HashMap<String, Value>,
    working_directory: Option<String>,
}

/// One client connection: its settings and the sessions it opens.
struct Connection {
    id: ConnectionId,
    state: AppState,
    outbound: mpsc::Sender<Envelope>,
    settings: Settings,
}

impl Connection {
    fn new(state: AppState, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            outbound,
            settings: Settings::default(),
        }
    }

    /// Handle one text frame, returning the direct replies. Session
    /// traffic flows separately through the outbound channel.
    async fn handle_frame(&mut self, text: &str) -> Vec<ServerMessage> {
        let message = match ClientMessage::parse(text) {
            Ok((_, message)) => message,
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Rejected client frame");
                return vec![ServerMessage::error(None, ErrorCode::InvalidRequest, e.to_string())];
            }
        };

        match message {
            ClientMessage::Query(request) => vec![self.on_query(request).await],
            ClientMessage::Cancel(request) => self.on_cancel(request).await.into_iter().collect(),
            ClientMessage::Configure(request) => vec![self.on_configure(request)],
            ClientMessage::Ping => vec![ServerMessage::Pong(Empty {})],
        }
    }

    async fn on_query(&self, request: QueryRequest) -> ServerMessage {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reject = |message: String| {
            ServerMessage::error(Some(&session_id), ErrorCode::InvalidRequest, message)
        };

        if self.state.registry.contains(&session_id).await {
            return reject(format!("Session {session_id} already has an active query"));
        }

        let options = request.options;
        let Some(repository) = options
            .repository
            .or_else(|| self.settings.working_directory.clone())
            .or_else(|| self.state.config.default_repository.clone())
        else {
            return reject("No repository given and no working directory configured".into());
        };

        let new_task = NewTask {
            name: options
                .name
                .unwrap_or_else(|| format!("session {session_id}")),
            prompt: request.prompt,
            repository,
            branch: options.branch,
            priority: options.priority.unwrap_or_default(),
            timeout_seconds: options.timeout_seconds,
            session_id: Some(session_id.clone()),
        };
        let task = match self.state.scheduler.prepare(new_task) {
            Ok(task) => task,
            Err(e) => return reject(e.to_string()),
        };

        if let Err(e) = self
            .state
            .registry
            .register(Session::new(&session_id, self.id, task.id))
            .await
        {
            return reject(e.to_string());
        }

        let execution = ExecutionOptions {
            model: options.model,
            max_turns: options.max_turns,
            api_key: self.settings.api_key.clone(),
            mcp_servers: self.settings.mcp_servers.clone(),
            working_directory: self.settings.working_directory.as_ref().map(PathBuf::from),
        };
        let link = SessionLink::new(
            &session_id,
            self.outbound.clone(),
            Arc::clone(&self.state.registry),
            execution,
        );

        match self.state.scheduler.submit_prepared(task, Some(link)).await {
            Ok(task) => {
                info!(
                    connection_id = %self.id,
                    session_id = %session_id,
                    task_id = %task.id,
                    priority = %task.priority,
                    "Query accepted"
                );
                ServerMessage::progress(&session_id, ProgressStage::Queued, "Task queued", None)
            }
            Err(e) => {
                self.state.registry.remove(&session_id).await;
                reject(e.to_string())
            }
        }
    }

    async fn on_cancel(&self, request: CancelRequest) -> Option<ServerMessage> {
        let session_id = request.session_id;
        let task_id = match self.state.registry.mark_cancelled(&session_id, self.id).await {
            Ok(task_id) => task_id,
            Err(e) => {
                return Some(ServerMessage::error(
                    Some(&session_id),
                    ErrorCode::InvalidRequest,
                    e.to_string(),
                ));
            }
        };

        match self.state.scheduler.cancel(task_id).await {
            Ok(CancelOutcome::AlreadyFinished(status)) => {
                debug!(session_id = %session_id, status = %status, "Cancel after finish ignored");
            }
            Ok(outcome) => {
                info!(session_id = %session_id, task_id = %task_id, ?outcome, "Session cancel requested");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Cancel failed");
            }
        }
        None
    }

    fn on_configure(&mut self, request: ConfigureRequest) -> ServerMessage {
        if let Some(key) = request.api_key {
            self.settings.api_key = Some(Arc::new(SecretString::from(key)));
        }
        if let Some(servers) = request.mcp_servers {
            self.settings.mcp_servers = servers;
        }
        if let Some(dir) = request.working_directory {
            self.settings.working_directory = Some(dir);
        }

        let mut active: Vec<String> = self.settings.mcp_servers.keys().cloned().collect();
        active.sort();
        debug!(connection_id = %self.id, mcp_servers = active.len(), "Connection configured");

        ServerMessage::Configured(ConfiguredPayload {
            success: true,
            active_mcp_servers: active,
            working_directory: self.settings.working_directory.clone(),
        })
    }

    /// Cancel every session this connection still owns.
    async fn close(&self) {
        for session in self.state.registry.owned_by(self.id).await {
            if self
                .state
                .registry
                .mark_cancelled(&session.id, self.id)
                .await
                .is_err()
            {
                continue;
            }
            match self.state.scheduler.cancel(session.task_id).await {
                Ok(_) => {
                    info!(session_id = %session.id, task_id = %session.task_id, "Session cancelled on disconnect")
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Cancel on disconnect failed"),
            }
        }
    }
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> impl IntoResponse {
    Json(state.scheduler.queue().list(&filter).await)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "Invalid task ID").into_response();
    };

    match state.scheduler.queue().get(task_id).await {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, "Task not found").into_response(),
    }
}

async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.scheduler.pool();
    Json(serde_json::json!({
        "stats": pool.stats().await,
        "workers": pool.workers().await,
        "queue": state.scheduler.queue().stats().await,
    }))
}
