//! Agent runner: queues agent tasks, runs them on an elastic worker pool
//! and streams their progress to WebSocket sessions.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod session;
pub mod tasks;
pub mod telemetry;
