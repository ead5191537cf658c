//! Worker records tracked by the pool.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::PoolError;
use crate::tasks::TaskId;

/// Pool-assigned worker identifier.
pub type WorkerId = String;

/// State of a worker as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No running tasks.
    Idle,
    /// At least one running task.
    Busy,
    /// Accepts no new work; destroyed once empty.
    Draining,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

/// A provisioned compute unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: WorkerId,
    /// Provider handle used for destroy/status calls.
    pub handle: String,
    pub address: String,
    pub state: WorkerState,
    pub running_tasks: HashSet<TaskId>,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Monotonic twin of `last_activity_at`, used for idle eviction.
    #[serde(skip)]
    last_active: Instant,
}

impl Worker {
    pub fn new(
        id: impl Into<WorkerId>,
        handle: impl Into<String>,
        address: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            handle: handle.into(),
            address: address.into(),
            state: WorkerState::Idle,
            running_tasks: HashSet::new(),
            capacity,
            created_at: now,
            last_activity_at: now,
            last_active: Instant::now(),
        }
    }

    pub fn running_task_count(&self) -> usize {
        self.running_tasks.len()
    }

    pub fn is_draining(&self) -> bool {
        self.state == WorkerState::Draining
    }

    /// Can accept another task.
    pub fn has_capacity(&self) -> bool {
        !self.is_draining() && self.running_tasks.len() < self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.running_tasks.is_empty()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Time since the last assign/release.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    pub fn assign(&mut self, task_id: TaskId) -> Result<(), PoolError> {
        if self.is_draining() {
            return Err(PoolError::Draining {
                id: self.id.clone(),
            });
        }
        if self.running_tasks.len() >= self.capacity {
            return Err(PoolError::AtCapacity {
                id: self.id.clone(),
                capacity: self.capacity,
            });
        }
        self.running_tasks.insert(task_id);
        self.touch();
        Ok(())
    }

    pub fn release(&mut self, task_id: TaskId) -> Result<(), PoolError> {
        if !self.running_tasks.remove(&task_id) {
            return Err(PoolError::TaskNotAssigned {
                id: self.id.clone(),
                task_id,
            });
        }
        self.touch();
        Ok(())
    }

    pub fn mark_draining(&mut self) {
        self.state = WorkerState::Draining;
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_active = Instant::now();
        if !self.is_draining() {
            self.state = if self.running_tasks.is_empty() {
                WorkerState::Idle
            } else {
                WorkerState::Busy
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn worker(capacity: usize) -> Worker {
        Worker::new("worker-1", "local-1", "local://worker-1", capacity)
    }

    #[test]
    fn state_tracks_running_tasks() {
        let mut w = worker(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(w.state, WorkerState::Idle);
        w.assign(a).unwrap();
        assert_eq!(w.state, WorkerState::Busy);
        w.assign(b).unwrap();
        assert!(!w.has_capacity());

        w.release(a).unwrap();
        assert_eq!(w.state, WorkerState::Busy);
        w.release(b).unwrap();
        assert_eq!(w.state, WorkerState::Idle);
        assert!(w.is_empty());
    }

    #[test]
    fn assign_respects_capacity() {
        let mut w = worker(1);
        w.assign(Uuid::new_v4()).unwrap();
        let err = w.assign(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { capacity: 1, .. }));
        assert_eq!(w.running_task_count(), 1);
    }

    #[test]
    fn release_unknown_task_fails() {
        let mut w = worker(1);
        let err = w.release(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PoolError::TaskNotAssigned { .. }));
    }

    #[test]
    fn draining_rejects_work_and_stays_draining() {
        let mut w = worker(2);
        let a = Uuid::new_v4();
        w.assign(a).unwrap();
        w.mark_draining();

        assert!(!w.has_capacity());
        assert!(matches!(
            w.assign(Uuid::new_v4()),
            Err(PoolError::Draining { .. })
        ));

        w.release(a).unwrap();
        assert_eq!(w.state, WorkerState::Draining);
    }
}
