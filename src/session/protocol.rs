//! Wire protocol: typed envelopes exchanged over the WebSocket.
//!
//! Every frame is `{id, type, timestamp, payload}`. Client frames are parsed
//! in two steps (envelope, then payload by `type`) so a bad payload can be
//! reported against the frame's id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::SessionState;
use crate::error::ProtocolError;
use crate::tasks::TaskPriority;

// ── Client → server ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Options accepted with a `query`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub name: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub priority: Option<TaskPriority>,
    pub timeout_seconds: Option<u64>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    /// Plain on the wire; wrapped in a secret as soon as it is read.
    pub api_key: Option<String>,
    pub mcp_servers: Option<HashMap<String, Value>>,
    pub working_directory: Option<String>,
}

/// A parsed client frame.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Query(QueryRequest),
    Cancel(CancelRequest),
    Configure(ConfigureRequest),
    Ping,
}

impl ClientMessage {
    /// Parse a text frame into its envelope id and message.
    pub fn parse(text: &str) -> Result<(Option<String>, Self), ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let bad_payload = |kind: &str| {
            let kind = kind.to_string();
            move |e: serde_json::Error| ProtocolError::Malformed(format!("{kind} payload: {e}"))
        };

        let message = match raw.kind.as_str() {
            "query" => Self::Query(serde_json::from_value(raw.payload).map_err(bad_payload("query"))?),
            "cancel" => {
                Self::Cancel(serde_json::from_value(raw.payload).map_err(bad_payload("cancel"))?)
            }
            "configure" => {
                let payload = match raw.payload {
                    Value::Null => ConfigureRequest::default(),
                    p => serde_json::from_value(p).map_err(bad_payload("configure"))?,
                };
                Self::Configure(payload)
            }
            "ping" => Self::Ping,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok((raw.id, message))
    }
}

// ── Server → client ─────────────────────────────────────────────────

/// Error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationError,
    RateLimitError,
    ContextOverflow,
    Timeout,
    McpError,
    ToolError,
    InternalError,
    /// Protocol misuse: malformed frame, duplicate or unknown session.
    InvalidRequest,
}

impl ErrorCode {
    /// Whether a client may retry with a fresh query.
    pub fn recoverable(self) -> bool {
        !matches!(self, Self::AuthenticationError | Self::InvalidRequest)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::RateLimitError => "RATE_LIMIT_ERROR",
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::Timeout => "TIMEOUT",
            Self::McpError => "MCP_ERROR",
            Self::ToolError => "TOOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
        };
        write!(f, "{s}")
    }
}

/// Stage reported by `progress` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Queued,
    Initializing,
    Processing,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContent {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub session_id: String,
    pub stage: ProgressStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub session_id: String,
    pub content: Vec<ResponseContent>,
    pub turn: u32,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsePayload {
    pub session_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub session_id: String,
    pub tool_id: String,
    pub output: String,
    pub is_error: bool,
    /// Milliseconds since the matching `tool_use`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub session_id: String,
    pub status: SessionState,
    pub total_turns: u32,
    pub tokens_used: u64,
    /// Milliseconds from query to completion.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredPayload {
    pub success: bool,
    pub active_mcp_servers: Vec<String>,
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Empty {}

/// A server frame body, tagged by `type` with its `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Progress(ProgressPayload),
    Response(ResponsePayload),
    ToolUse(ToolUsePayload),
    ToolResult(ToolResultPayload),
    Error(ErrorPayload),
    Complete(CompletePayload),
    Configured(ConfiguredPayload),
    Pong(Empty),
}

impl ServerMessage {
    pub fn progress(
        session_id: &str,
        stage: ProgressStage,
        message: impl Into<String>,
        turn: Option<u32>,
    ) -> Self {
        Self::Progress(ProgressPayload {
            session_id: session_id.to_string(),
            stage,
            message: message.into(),
            turn,
        })
    }

    pub fn error(session_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            session_id: session_id.map(str::to_string),
            code,
            message: message.into(),
            recoverable: code.recoverable(),
        })
    }

    /// The session this message belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Progress(p) => Some(&p.session_id),
            Self::Response(p) => Some(&p.session_id),
            Self::ToolUse(p) => Some(&p.session_id),
            Self::ToolResult(p) => Some(&p.session_id),
            Self::Error(p) => p.session_id.as_deref(),
            Self::Complete(p) => Some(&p.session_id),
            Self::Configured(_) | Self::Pong(_) => None,
        }
    }

    /// Advisory messages that may be dropped under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Progress(_))
    }
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_query_with_options() {
        let frame = json!({
            "id": "m1",
            "type": "query",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {
                "prompt": "fix the tests",
                "sessionId": "s1",
                "options": {"repository": "org/repo", "priority": "urgent", "maxTurns": 3}
            }
        });

        let (id, msg) = ClientMessage::parse(&frame.to_string()).unwrap();
        assert_eq!(id.as_deref(), Some("m1"));
        let ClientMessage::Query(q) = msg else {
            panic!("expected query");
        };
        assert_eq!(q.session_id.as_deref(), Some("s1"));
        assert_eq!(q.options.priority, Some(TaskPriority::Urgent));
        assert_eq!(q.options.max_turns, Some(3));
    }

    #[test]
    fn parse_ping_without_payload() {
        let (_, msg) = ClientMessage::parse(r#"{"id":"p","type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = ClientMessage::parse(r#"{"id":"x","type":"subscribe","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "subscribe"));
    }

    #[test]
    fn parse_rejects_bad_payload() {
        let err = ClientMessage::parse(r#"{"type":"cancel","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn envelope_serializes_type_and_payload() {
        let env = Envelope::new(ServerMessage::error(
            Some("s1"),
            ErrorCode::AuthenticationError,
            "bad key",
        ));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "AUTHENTICATION_ERROR");
        assert_eq!(value["payload"]["recoverable"], false);
        assert_eq!(value["payload"]["sessionId"], "s1");
        assert!(value["id"].as_str().is_some());
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn pong_has_empty_payload() {
        let value = serde_json::to_value(Envelope::new(ServerMessage::Pong(Empty {}))).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["payload"], json!({}));
    }

    #[test]
    fn tool_result_uses_camel_case() {
        let msg = ServerMessage::ToolResult(ToolResultPayload {
            session_id: "s".into(),
            tool_id: "t1".into(),
            output: "ok".into(),
            is_error: false,
            duration: Some(12),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["payload"]["toolId"], "t1");
        assert_eq!(value["payload"]["isError"], false);
    }

    #[test]
    fn only_auth_and_invalid_are_fatal() {
        assert!(!ErrorCode::AuthenticationError.recoverable());
        assert!(!ErrorCode::InvalidRequest.recoverable());
        assert!(ErrorCode::RateLimitError.recoverable());
        assert!(ErrorCode::InternalError.recoverable());
    }
}
