//! Task data model: priorities, statuses and the task record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Task identifier.
pub type TaskId = Uuid;

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Dispatch weight; higher runs first.
    pub fn weight(self) -> u8 {
        match self {
            Self::Urgent => 4,
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Built but not yet accepted by the queue.
    Pending,
    /// Waiting for dispatch.
    Queued,
    /// Assigned to a worker and executing.
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Killed by the timeout watchdog.
    Timeout,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another one.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) | (Pending, Cancelled) |
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) | (Running, Timeout)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    pub prompt: String,
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Falls back to the queue's default timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Session streaming this task, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl NewTask {
    pub fn new(
        name: impl Into<String>,
        prompt: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            repository: repository.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Reject requests missing required fields.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::validation("name", "is required"));
        }
        if self.prompt.trim().is_empty() {
            return Err(QueueError::validation("prompt", "is required"));
        }
        if self.repository.trim().is_empty() {
            return Err(QueueError::validation("repository", "is required"));
        }
        if self.timeout_seconds == Some(0) {
            return Err(QueueError::validation(
                "timeoutSeconds",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A unit of work submitted for remote agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub prompt: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub repository: String,
    pub branch: Option<String>,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub session_id: Option<String>,
    /// Failure or cancellation reason for terminal tasks.
    pub error: Option<String>,
    /// A cancel arrived while running; finalization is pending.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Insertion order within the queue; breaks `created_at` ties.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    /// Build a pending task from a validated request.
    pub fn from_request(request: NewTask, default_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            prompt: request.prompt,
            priority: request.priority,
            status: TaskStatus::Pending,
            repository: request.repository,
            branch: request.branch,
            timeout_seconds: request
                .timeout_seconds
                .unwrap_or_else(|| default_timeout.as_secs().max(1)),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            session_id: request.session_id,
            error: None,
            cancel_requested: false,
            sequence: 0,
        }
    }

    /// Transition to a new status, stamping timestamps.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.status = target;
        let now = Utc::now();

        match target {
            TaskStatus::Running => {
                self.started_at = Some(now.max(self.created_at));
            }
            s if s.is_terminal() => {
                let floor = self.started_at.unwrap_or(self.created_at);
                self.completed_at = Some(now.max(floor));
            }
            _ => {}
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time between start (or creation) and completion.
    pub fn elapsed(&self) -> Duration {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(start)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub repository: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.priority.is_none_or(|p| p == task.priority)
            && self
                .repository
                .as_deref()
                .is_none_or(|r| r == task.repository)
    }
}
