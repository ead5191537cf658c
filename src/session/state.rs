//! Per-session state machine and the outbound link a task streams through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use super::protocol::{Envelope, ProgressStage, ServerMessage};
use super::registry::SessionRegistry;
use crate::agent::ExecutionOptions;
use crate::tasks::{TaskId, TaskStatus};

/// Identifies one client connection.
pub type ConnectionId = Uuid;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Query accepted, task waiting for or starting on a worker.
    Initializing,
    /// The agent is producing output.
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Initializing, Processing) | (Initializing, Cancelled) | (Initializing, Error) |
            (Processing, Completed) | (Processing, Error) | (Processing, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Session outcome for a terminal task status.
    pub fn from_task_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Completed => Some(Self::Completed),
            TaskStatus::Cancelled => Some(Self::Cancelled),
            TaskStatus::Failed | TaskStatus::Timeout => Some(Self::Error),
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A live execution scoped to one task and one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub connection_id: ConnectionId,
    pub task_id: TaskId,
    pub state: SessionState,
    pub turn_counter: u32,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, connection_id: ConnectionId, task_id: TaskId) -> Self {
        Self {
            id: id.into(),
            connection_id,
            task_id,
            state: SessionState::Initializing,
            turn_counter: 0,
            started_at: Utc::now(),
            cancelled: false,
        }
    }

    /// Advance the state machine from an outbound message. Invalid moves
    /// are ignored.
    pub fn observe(&mut self, message: &ServerMessage) {
        let target = match message {
            ServerMessage::Progress(p) if p.stage == ProgressStage::Processing => {
                Some(SessionState::Processing)
            }
            ServerMessage::Response(p) => {
                self.turn_counter = self.turn_counter.max(p.turn);
                Some(SessionState::Processing)
            }
            ServerMessage::ToolUse(_) | ServerMessage::ToolResult(_) => {
                Some(SessionState::Processing)
            }
            ServerMessage::Complete(p) => {
                self.turn_counter = self.turn_counter.max(p.total_turns);
                Some(p.status)
            }
            _ => None,
        };

        if let Some(target) = target {
            if self.state.can_transition_to(target) {
                debug!(session_id = %self.id, from = %self.state, to = %target, "Session state change");
                self.state = target;
            }
        }
    }
}

/// Outbound handle a dispatched task uses to stream to its session.
#[derive(Clone)]
pub struct SessionLink {
    session_id: String,
    outbound: mpsc::Sender<Envelope>,
    registry: Arc<SessionRegistry>,
    options: ExecutionOptions,
}

impl SessionLink {
    pub fn new(
        session_id: impl Into<String>,
        outbound: mpsc::Sender<Envelope>,
        registry: Arc<SessionRegistry>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            outbound,
            registry,
            options,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Send an authoritative message, waiting for buffer space. Returns
    /// false once the connection is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.registry.observe(&self.session_id, &message).await;
        self.outbound.send(Envelope::new(message)).await.is_ok()
    }

    /// Send an advisory message, dropping it if the buffer is full.
    pub async fn notify(&self, message: ServerMessage) -> bool {
        self.registry.observe(&self.session_id, &message).await;
        match self.outbound.try_send(Envelope::new(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %self.session_id, "Outbound buffer full, progress dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Send messages in order without blocking the caller.
    pub fn deliver(&self, messages: Vec<ServerMessage>) {
        let link = self.clone();
        tokio::spawn(async move {
            for message in messages {
                link.send(message).await;
            }
        });
    }
}
