//! Registry of active sessions across all connections.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::ServerMessage;
use super::state::{ConnectionId, Session};
use crate::error::ProtocolError;
use crate::tasks::TaskId;

/// Active sessions keyed by id. A session leaves the registry once it
/// reaches a terminal state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; an active session with the same id is never replaced.
    pub async fn register(&self, session: Session) -> Result<(), ProtocolError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(ProtocolError::SessionActive(session.id));
        }
        debug!(session_id = %session.id, task_id = %session.task_id, "Session registered");
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Feed an outbound message to the session's state machine, dropping
    /// the session once terminal.
    pub async fn observe(&self, id: &str, message: &ServerMessage) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        session.observe(message);
        if session.state.is_terminal() {
            sessions.remove(id);
            debug!(session_id = id, "Session closed");
        }
    }

    /// Flag a session as cancelled. Only the owning connection may do so.
    pub async fn mark_cancelled(
        &self,
        id: &str,
        connection_id: ConnectionId,
    ) -> Result<TaskId, ProtocolError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .filter(|s| s.connection_id == connection_id)
            .ok_or_else(|| ProtocolError::SessionNotFound(id.to_string()))?;
        session.cancelled = true;
        Ok(session.task_id)
    }

    /// Sessions owned by one connection.
    pub async fn owned_by(&self, connection_id: ConnectionId) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.connection_id == connection_id)
            .cloned()
            .collect()
    }

    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::session::protocol::CompletePayload;
    use crate::session::state::SessionState;

    #[tokio::test]
    async fn duplicate_active_session_rejected() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        registry.register(Session::new("s1", conn, Uuid::new_v4())).await.unwrap();

        let other_conn = Uuid::new_v4();
        let err = registry
            .register(Session::new("s1", other_conn, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SessionActive(id) if id == "s1"));
        assert_eq!(registry.get("s1").await.unwrap().connection_id, conn);
    }

    #[tokio::test]
    async fn terminal_session_is_released() {
        let registry = SessionRegistry::new();
        registry
            .register(Session::new("s1", Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        registry
            .observe(
                "s1",
                &ServerMessage::Complete(CompletePayload {
                    session_id: "s1".into(),
                    status: SessionState::Cancelled,
                    total_turns: 0,
                    tokens_used: 0,
                    duration: 0,
                }),
            )
            .await;

        assert!(!registry.contains("s1").await);
        // The id is free again.
        registry
            .register(Session::new("s1", Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_requires_owner() {
        let registry = SessionRegistry::new();
        let owner = Uuid::new_v4();
        let task = Uuid::new_v4();
        registry.register(Session::new("s1", owner, task)).await.unwrap();

        assert!(matches!(
            registry.mark_cancelled("s1", Uuid::new_v4()).await,
            Err(ProtocolError::SessionNotFound(_))
        ));
        assert_eq!(registry.mark_cancelled("s1", owner).await.unwrap(), task);
        assert!(registry.get("s1").await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn owned_by_filters_connection() {
        let registry = SessionRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(Session::new("s1", a, Uuid::new_v4())).await.unwrap();
        registry.register(Session::new("s2", a, Uuid::new_v4())).await.unwrap();
        registry.register(Session::new("s3", b, Uuid::new_v4())).await.unwrap();

        let mut owned: Vec<String> = registry.owned_by(a).await.into_iter().map(|s| s.id).collect();
        owned.sort();
        assert_eq!(owned, vec!["s1", "s2"]);
        assert_eq!(registry.len().await, 3);
    }
}
