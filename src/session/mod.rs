//! Session protocol server.
//!
//! - `protocol`: envelope and message types
//! - `state`: per-session state machine and outbound link
//! - `registry`: active sessions across connections
//! - `server`: axum WebSocket and REST routes

pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;

pub use protocol::{
    ClientMessage, CompletePayload, ConfiguredPayload, Empty, Envelope, ErrorCode, ErrorPayload,
    ProgressPayload, ProgressStage, QueryOptions, QueryRequest, ResponseContent, ResponsePayload,
    ServerMessage, ToolResultPayload, ToolUsePayload,
};
pub use registry::SessionRegistry;
pub use server::{AppState, router};
pub use state::{ConnectionId, Session, SessionLink, SessionState};
