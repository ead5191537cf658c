//! Priority task queue with a concurrency ceiling and timeout watchdogs.
//!
//! All mutation goes through the `TaskQueue` methods, which serialize on a
//! single lock. Lifecycle changes are announced on an unbounded
//! [`QueueEvent`] channel consumed by the dispatcher.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{NewTask, Task, TaskFilter, TaskId, TaskStatus};
use crate::config::QueueConfig;
use crate::error::QueueError;

/// Lifecycle notifications emitted by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A task became ready for dispatch.
    Added(TaskId),
    /// A task reached a terminal status.
    Finished { task_id: TaskId, status: TaskStatus },
}

/// Result of [`TaskQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was queued and is now cancelled.
    Cancelled,
    /// The task is running; its cancellation token was tripped.
    Requested,
    /// The task had already finished.
    AlreadyFinished(TaskStatus),
}

/// Handed to the dispatcher when a task starts running.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub task: Task,
    pub cancel: CancellationToken,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub max_concurrent: usize,
}

struct RunningSlot {
    cancel: CancellationToken,
    watchdog: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    running: HashMap<TaskId, RunningSlot>,
    next_sequence: u64,
}

impl QueueState {
    fn insert(&mut self, mut task: Task) -> Task {
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tasks.insert(task.id, task.clone());
        task
    }

    /// Highest weight first, then oldest, then earliest inserted.
    fn next_ready(&self) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .max_by_key(|t| {
                (
                    t.priority.weight(),
                    Reverse(t.created_at),
                    Reverse(t.sequence),
                )
            })
    }

    /// Move a task to a terminal status. Returns `None` when the task is
    /// unknown or already terminal, which makes every terminal writer
    /// after the first a no-op.
    fn finish(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Option<(Task, Option<RunningSlot>)> {
        let task = self.tasks.get_mut(&id)?;
        if !status.is_terminal() || task.transition_to(status).is_err() {
            return None;
        }
        if reason.is_some() {
            task.error = reason;
        }
        let task = task.clone();
        let slot = self.running.remove(&id);
        Some((task, slot))
    }
}

/// In-memory priority queue of tasks.
pub struct TaskQueue {
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl TaskQueue {
    /// Create a new queue and the receiver for its lifecycle events.
    pub fn new(config: QueueConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
            events,
        });
        (queue, events_rx)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn emit(&self, event: QueueEvent) {
        // The dispatcher may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    /// Validate and enqueue a task.
    pub async fn add(&self, request: NewTask) -> Result<Task, QueueError> {
        request.validate()?;
        let task = Task::from_request(request, self.config.default_timeout);
        self.enqueue(task).await
    }

    /// Enqueue an already-built pending task (its id may be known to callers).
    pub async fn enqueue(&self, mut task: Task) -> Result<Task, QueueError> {
        task.transition_to(TaskStatus::Queued)?;
        let task = self.state.lock().await.insert(task);

        info!(
            task_id = %task.id,
            name = %task.name,
            priority = %task.priority,
            repository = %task.repository,
            "Task queued"
        );

        self.emit(QueueEvent::Added(task.id));
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    /// List tasks matching `filter`, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        drop(state);

        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// The next task to dispatch, or `None` when nothing is queued or the
    /// concurrency ceiling is reached.
    pub async fn next_ready(&self) -> Option<Task> {
        let state = self.state.lock().await;
        if state.running.len() >= self.config.max_concurrent {
            return None;
        }
        state.next_ready().cloned()
    }

    /// Flip a queued task to running on `worker_id` and arm its watchdog.
    pub async fn start(&self, id: TaskId, worker_id: &str) -> Result<RunTicket, QueueError> {
        let mut state = self.state.lock().await;

        if state.running.len() >= self.config.max_concurrent {
            return Err(QueueError::AtCapacity {
                max: self.config.max_concurrent,
            });
        }

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(QueueError::NotFound { id })?;
        task.transition_to(TaskStatus::Running)?;
        task.assigned_worker = Some(worker_id.to_string());
        let task = task.clone();

        let cancel = CancellationToken::new();
        let watchdog = self.spawn_watchdog(&task, cancel.clone());
        state.running.insert(
            id,
            RunningSlot {
                cancel: cancel.clone(),
                watchdog: Some(watchdog),
            },
        );
        drop(state);

        info!(
            task_id = %id,
            worker_id,
            timeout_secs = task.timeout_seconds,
            "Task started"
        );

        Ok(RunTicket { task, cancel })
    }

    /// Sleep for the task's timeout, then force it to `timeout` if it is
    /// still running. Aborted on natural completion.
    fn spawn_watchdog(&self, task: &Task, cancel: CancellationToken) -> AbortHandle {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let task_id = task.id;
        let timeout = task.timeout();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let finished = state.lock().await.finish(
                task_id,
                TaskStatus::Timeout,
                Some(format!("Task exceeded its {}s timeout", timeout.as_secs())),
            );

            if finished.is_some() {
                warn!(task_id = %task_id, timeout_secs = timeout.as_secs(), "Task timed out");
                cancel.cancel();
                let _ = events.send(QueueEvent::Finished {
                    task_id,
                    status: TaskStatus::Timeout,
                });
            }
        });

        handle.abort_handle()
    }

    /// Cancel a task. Queued tasks finish immediately; running tasks get a
    /// cancellation request that the dispatcher finalizes.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let status = state
            .tasks
            .get(&id)
            .map(|t| t.status)
            .ok_or(QueueError::NotFound { id })?;

        match status {
            TaskStatus::Pending | TaskStatus::Queued => {
                state.finish(id, TaskStatus::Cancelled, Some("Cancelled before start".into()));
                drop(state);
                info!(task_id = %id, "Queued task cancelled");
                self.emit(QueueEvent::Finished {
                    task_id: id,
                    status: TaskStatus::Cancelled,
                });
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Running => {
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.cancel_requested = true;
                }
                if let Some(slot) = state.running.get(&id) {
                    slot.cancel.cancel();
                }
                drop(state);
                info!(task_id = %id, "Cancellation requested for running task");
                Ok(CancelOutcome::Requested)
            }
            terminal => Ok(CancelOutcome::AlreadyFinished(terminal)),
        }
    }

    /// Record the natural end of a running task. Idempotent: returns false
    /// when the task was already terminal.
    pub async fn complete(&self, id: TaskId, success: bool) -> bool {
        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.finish(id, status, None).await
    }

    /// Move a task to any terminal status. The first terminal writer wins.
    pub async fn finish(&self, id: TaskId, status: TaskStatus, reason: Option<String>) -> bool {
        let finished = self.state.lock().await.finish(id, status, reason);
        let Some((task, slot)) = finished else {
            debug!(task_id = %id, %status, "Finish ignored, task already terminal or unknown");
            return false;
        };

        if let Some(watchdog) = slot.and_then(|s| s.watchdog) {
            watchdog.abort();
        }

        info!(
            task_id = %id,
            status = %task.status,
            elapsed_ms = task.elapsed().as_millis() as u64,
            "Task finished"
        );

        self.emit(QueueEvent::Finished {
            task_id: id,
            status: task.status,
        });
        true
    }

    /// Force-finalize a running task and trip its cancellation token.
    pub async fn abort(&self, id: TaskId, status: TaskStatus, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let finished = self.state.lock().await.finish(id, status, Some(reason.clone()));
        let Some((_, slot)) = finished else {
            return false;
        };

        if let Some(slot) = slot {
            slot.cancel.cancel();
            if let Some(watchdog) = slot.watchdog {
                watchdog.abort();
            }
        }

        warn!(task_id = %id, %status, reason = %reason, "Task aborted");
        self.emit(QueueEvent::Finished { task_id: id, status });
        true
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            running: state.running.len(),
            max_concurrent: self.config.max_concurrent,
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued | TaskStatus::Pending => stats.queued += 1,
                s if s.is_terminal() => stats.finished += 1,
                _ => {}
            }
        }
        stats
    }

    /// Drop terminal tasks older than the retention window, then trim the
    /// oldest ones beyond `max_history`. Returns the number removed.
    pub async fn purge_history(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.history_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut state = self.state.lock().await;
        let before = state.tasks.len();

        state
            .tasks
            .retain(|_, t| !(t.is_finished() && t.completed_at.is_some_and(|c| c < cutoff)));

        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|t| t.is_finished())
            .map(|t| (t.completed_at.unwrap_or(t.created_at), t.id))
            .collect();
        if finished.len() > self.config.max_history {
            finished.sort();
            let excess = finished.len() - self.config.max_history;
            for (_, id) in finished.into_iter().take(excess) {
                state.tasks.remove(&id);
            }
        }

        let removed = before - state.tasks.len();
        drop(state);

        if removed > 0 {
            info!(count = removed, "Purged finished tasks from history");
        }
        removed
    }

    /// Write every task to the configured snapshot file.
    pub async fn save_snapshot(&self) -> Result<usize, QueueError> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(0);
        };

        let tasks = self.list(&TaskFilter::default()).await;
        let json = serde_json::to_vec_pretty(&tasks)
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| QueueError::Snapshot(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| QueueError::Snapshot(format!("rename {}: {e}", path.display())))?;

        debug!(count = tasks.len(), path = %path.display(), "Saved queue snapshot");
        Ok(tasks.len())
    }

    /// Reload tasks from the snapshot file. Unfinished tasks come back as
    /// queued since their workers did not survive the restart. Returns the
    /// number of tasks re-queued.
    pub async fn load_snapshot(&self) -> Result<usize, QueueError> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(0);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| QueueError::Snapshot(format!("read {}: {e}", path.display())))?;
        let mut tasks: Vec<Task> =
            serde_json::from_slice(&bytes).map_err(|e| QueueError::Snapshot(e.to_string()))?;
        tasks.sort_by_key(|t| (t.created_at, t.sequence));

        let mut requeued = Vec::new();
        {
            let mut state = self.state.lock().await;
            for mut task in tasks {
                if !task.is_finished() {
                    task.status = TaskStatus::Queued;
                    task.started_at = None;
                    task.assigned_worker = None;
                    task.cancel_requested = false;
                    requeued.push(task.id);
                }
                state.insert(task);
            }
        }

        for id in &requeued {
            self.emit(QueueEvent::Added(*id));
        }

        info!(requeued = requeued.len(), path = %path.display(), "Restored tasks from snapshot");
        Ok(requeued.len())
    }
}

/// Spawn a background task that periodically purges history and refreshes
/// the snapshot.
pub fn spawn_sweeper(queue: Arc<TaskQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(queue.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            queue.purge_history().await;
            if let Err(e) = queue.save_snapshot().await {
                warn!(error = %e, "Failed to save queue snapshot");
            }
        }
    })
}
