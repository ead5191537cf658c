//! The single-writer dispatch loop.
//!
//! Only this actor moves tasks from queued to running, calls
//! `TaskQueue::complete`/`finish` for dispatched tasks, and calls
//! `WorkerPool::assign`/`release`. Every trigger arrives on a channel and
//! is handled to completion before the next, so a capacity slot can never
//! be handed out twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{ExecutionAdapter, ExecutionOutcome, ExecutionRequest, RunCounters, classify};
use crate::pool::{PoolEvent, WorkerId, WorkerPool};
use crate::session::{CompletePayload, ErrorCode, ServerMessage, SessionLink, SessionState};
use crate::tasks::{QueueEvent, RunTicket, Task, TaskId, TaskQueue, TaskStatus};

/// Messages from execution tasks and the scheduler handle.
#[derive(Debug)]
pub enum Control {
    ExecutionDone {
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: ExecutionOutcome,
    },
    Shutdown,
}

pub(crate) type Links = Arc<Mutex<HashMap<TaskId, SessionLink>>>;

pub(crate) struct Dispatcher {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) adapter: ExecutionAdapter,
    pub(crate) links: Links,
    pub(crate) queue_rx: mpsc::UnboundedReceiver<QueueEvent>,
    pub(crate) pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
    pub(crate) control_rx: mpsc::UnboundedReceiver<Control>,
    pub(crate) control_tx: mpsc::UnboundedSender<Control>,
    pub(crate) cancel_grace: Duration,
    pub(crate) in_flight: HashMap<TaskId, WorkerId>,
    pub(crate) shutting_down: bool,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        info!("Dispatcher started");
        // Tasks restored before the loop started are already queued.
        self.dispatch_pending().await;

        loop {
            tokio::select! {
                Some(event) = self.queue_rx.recv() => self.on_queue_event(event).await,
                Some(event) = self.pool_rx.recv() => self.on_pool_event(event).await,
                Some(control) = self.control_rx.recv() => match control {
                    Control::ExecutionDone { task_id, worker_id, outcome } => {
                        self.on_execution_done(task_id, worker_id, outcome).await;
                    }
                    Control::Shutdown => {
                        self.shutdown().await;
                        break;
                    }
                },
                else => break,
            }
        }

        info!("Dispatcher stopped");
    }

    async fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Added(_) => {}
            QueueEvent::Finished { task_id, status } => {
                // Running tasks finalize through ExecutionDone.
                if self.in_flight.contains_key(&task_id) {
                    debug!(task_id = %task_id, %status, "In-flight task finished, awaiting execution");
                } else {
                    self.finish_undispatched(task_id).await;
                }
            }
        }
        self.dispatch_pending().await;
    }

    /// A task that never ran (cancelled while queued) still owes its
    /// session a `complete`.
    async fn finish_undispatched(&self, task_id: TaskId) {
        let Some(link) = self.links.lock().await.remove(&task_id) else {
            return;
        };
        if let Some(task) = self.queue.get(task_id).await {
            link.deliver(terminal_messages(&link, &task, None, false));
        }
    }

    async fn on_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerReady(_) => {}
            PoolEvent::WorkerLost { worker_id, tasks } => {
                for task_id in tasks {
                    self.queue
                        .abort(task_id, TaskStatus::Failed, format!("Worker {worker_id} was lost"))
                        .await;
                }
            }
        }
        self.dispatch_pending().await;
    }

    /// Start as many queued tasks as capacity and workers allow.
    async fn dispatch_pending(&mut self) {
        while !self.shutting_down {
            let Some(task) = self.queue.next_ready().await else {
                return;
            };

            let Some(worker_id) = self.pool.get_available_worker().await else {
                if self.pool.request_scale_up().await {
                    info!(task_id = %task.id, "No worker available, scaling up");
                } else {
                    debug!(task_id = %task.id, "No worker available, task stays queued");
                }
                return;
            };

            if let Err(e) = self.pool.assign(&worker_id, task.id).await {
                warn!(task_id = %task.id, worker_id = %worker_id, error = %e, "Assign failed");
                return;
            }

            let ticket = match self.queue.start(task.id, &worker_id).await {
                Ok(ticket) => ticket,
                Err(e) => {
                    // Lost a race with a cancel; give the slot back.
                    debug!(task_id = %task.id, error = %e, "Start failed");
                    let _ = self.pool.release(&worker_id, task.id).await;
                    continue;
                }
            };

            self.spawn_execution(ticket, worker_id).await;
        }
    }

    async fn spawn_execution(&mut self, ticket: RunTicket, worker_id: WorkerId) {
        let RunTicket { task, cancel } = ticket;
        let link = self.links.lock().await.get(&task.id).cloned();
        let worker_address = self
            .pool
            .worker(&worker_id)
            .await
            .map(|w| w.address)
            .unwrap_or_default();

        let request = ExecutionRequest {
            task_id: task.id,
            session_id: task.session_id.clone(),
            prompt: task.prompt.clone(),
            repository: task.repository.clone(),
            branch: task.branch.clone(),
            worker_address,
            options: link
                .as_ref()
                .map(|l| l.options().clone())
                .unwrap_or_default(),
        };

        info!(task_id = %task.id, worker_id = %worker_id, "Dispatching task");
        self.in_flight.insert(task.id, worker_id.clone());

        let adapter = self.adapter.clone();
        let control = self.control_tx.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            let outcome = execute(adapter, request, link, cancel, grace).await;
            let _ = control.send(Control::ExecutionDone {
                task_id: task.id,
                worker_id,
                outcome,
            });
        });
    }

    async fn on_execution_done(
        &mut self,
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: ExecutionOutcome,
    ) {
        self.in_flight.remove(&task_id);

        // No-ops when the watchdog or an abort already finalized the task.
        match outcome.status {
            TaskStatus::Completed => {
                self.queue.complete(task_id, true).await;
            }
            status => {
                self.queue.finish(task_id, status, outcome.error.clone()).await;
            }
        }

        if let Err(e) = self.pool.release(&worker_id, task_id).await {
            debug!(task_id = %task_id, worker_id = %worker_id, error = %e, "Release skipped");
        }

        let link = self.links.lock().await.remove(&task_id);
        if let (Some(link), Some(task)) = (link, self.queue.get(task_id).await) {
            link.deliver(terminal_messages(
                &link,
                &task,
                Some(&outcome),
                outcome.error_reported,
            ));
        }

        self.dispatch_pending().await;
    }

    /// Cancel in-flight work and wait up to the grace period for it to
    /// report back.
    async fn shutdown(&mut self) {
        self.shutting_down = true;
        info!(in_flight = self.in_flight.len(), "Dispatcher shutting down");

        let running: Vec<TaskId> = self.in_flight.keys().copied().collect();
        for task_id in running {
            self.queue
                .abort(task_id, TaskStatus::Cancelled, "Runner shutting down")
                .await;
        }

        let deadline = Instant::now() + self.cancel_grace;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.control_rx.recv()).await {
                Ok(Some(Control::ExecutionDone {
                    task_id,
                    worker_id,
                    outcome,
                })) => self.on_execution_done(task_id, worker_id, outcome).await,
                Ok(Some(Control::Shutdown)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if !self.in_flight.is_empty() {
            warn!(remaining = self.in_flight.len(), "Executions did not stop in time");
        }
    }
}

/// Run the adapter; once cancelled, allow `grace` for it to wind down
/// before dropping it.
async fn execute(
    adapter: ExecutionAdapter,
    request: ExecutionRequest,
    link: Option<SessionLink>,
    cancel: CancellationToken,
    grace: Duration,
) -> ExecutionOutcome {
    let task_id = request.task_id;
    let counters = RunCounters::default();
    let run = adapter.run_counted(request, link.as_ref(), &cancel, &counters);
    tokio::pin!(run);

    tokio::select! {
        outcome = &mut run => outcome,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(task_id = %task_id, grace_ms = grace.as_millis() as u64, "Execution ignored cancellation, dropping it");
                    ExecutionOutcome::cancelled(counters.turns(), counters.tokens())
                }
            }
        }
    }
}

/// The missing `error` (if any) followed by exactly one `complete`.
fn terminal_messages(
    link: &SessionLink,
    task: &Task,
    outcome: Option<&ExecutionOutcome>,
    error_reported: bool,
) -> Vec<ServerMessage> {
    let session_id = link.session_id();
    let mut messages = Vec::with_capacity(2);

    if !error_reported {
        let reason = task.error.clone().unwrap_or_default();
        match task.status {
            TaskStatus::Timeout => {
                messages.push(ServerMessage::error(Some(session_id), ErrorCode::Timeout, reason));
            }
            TaskStatus::Failed => {
                let code = classify(&reason);
                messages.push(ServerMessage::error(Some(session_id), code, reason));
            }
            _ => {}
        }
    }

    let end = task.completed_at.unwrap_or_else(Utc::now);
    let duration = end
        .signed_duration_since(task.created_at)
        .num_milliseconds()
        .max(0) as u64;

    messages.push(ServerMessage::Complete(CompletePayload {
        session_id: session_id.to_string(),
        status: SessionState::from_task_status(task.status).unwrap_or(SessionState::Error),
        total_turns: outcome.map_or(0, |o| o.turns),
        tokens_used: outcome.map_or(0, |o| o.tokens),
        duration,
    }));
    messages
}
