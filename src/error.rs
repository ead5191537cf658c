//! Error types for the agent runner.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid task: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Maximum concurrent tasks ({max}) reached")]
    AtCapacity { max: usize },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl QueueError {
    pub(crate) fn validation(field: &str, reason: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Worker pool bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker {id} not found")]
    WorkerNotFound { id: String },

    #[error("Worker {id} is at capacity ({capacity})")]
    AtCapacity { id: String, capacity: usize },

    #[error("Worker {id} is draining")]
    Draining { id: String },

    #[error("Task {task_id} is not assigned to worker {id}")]
    TaskNotAssigned { id: String, task_id: Uuid },

    #[error("Pool initialization failed: {0}")]
    Initialization(#[from] ProvisionError),
}

/// Errors reported by a provisioner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to create worker: {reason}")]
    CreateFailed { reason: String },

    #[error("Failed to destroy worker {handle}: {reason}")]
    DestroyFailed { handle: String, reason: String },

    #[error("Status check for worker {handle} failed: {reason}")]
    StatusFailed { handle: String, reason: String },
}

/// Errors raised by an agent executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to start agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent failed: {message}")]
    Failed { message: String },

    #[error("Agent exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-level errors for a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Session {0} already has an active query")]
    SessionActive(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),
}
