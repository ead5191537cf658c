//! Public handle to the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::dispatcher::{Control, Dispatcher, Links};
use crate::agent::ExecutionAdapter;
use crate::config::DispatchConfig;
use crate::error::QueueError;
use crate::pool::{PoolEvent, WorkerPool};
use crate::session::SessionLink;
use crate::tasks::{CancelOutcome, NewTask, QueueEvent, Task, TaskId, TaskQueue};

/// Submits tasks and owns the dispatcher loop.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    links: Links,
    control: mpsc::UnboundedSender<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the dispatcher. Takes the event receivers of the queue and
    /// the pool; nothing else may consume them.
    pub fn start(
        queue: Arc<TaskQueue>,
        queue_rx: mpsc::UnboundedReceiver<QueueEvent>,
        pool: Arc<WorkerPool>,
        pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
        adapter: ExecutionAdapter,
        config: DispatchConfig,
    ) -> Arc<Self> {
        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            queue: Arc::clone(&queue),
            pool: Arc::clone(&pool),
            adapter,
            links: Arc::clone(&links),
            queue_rx,
            pool_rx,
            control_rx,
            control_tx: control_tx.clone(),
            cancel_grace: config.cancel_grace,
            in_flight: HashMap::new(),
            shutting_down: false,
        };
        let handle = tokio::spawn(dispatcher.run());

        Arc::new(Self {
            queue,
            pool,
            links,
            control: control_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Validate a request and build its task without queueing it, so the
    /// caller can learn the id first.
    pub fn prepare(&self, request: NewTask) -> Result<Task, QueueError> {
        request.validate()?;
        Ok(Task::from_request(request, self.queue.config().default_timeout))
    }

    /// Validate and queue a task, optionally streaming it to a session.
    pub async fn submit(
        &self,
        request: NewTask,
        link: Option<SessionLink>,
    ) -> Result<Task, QueueError> {
        let task = self.prepare(request)?;
        self.submit_prepared(task, link).await
    }

    /// Queue a task built by [`Scheduler::prepare`].
    pub async fn submit_prepared(
        &self,
        task: Task,
        link: Option<SessionLink>,
    ) -> Result<Task, QueueError> {
        let task_id = task.id;
        // The link must be in place before the dispatcher can see the task.
        if let Some(link) = link {
            self.links.lock().await.insert(task_id, link);
        }

        match self.queue.enqueue(task).await {
            Ok(task) => Ok(task),
            Err(e) => {
                self.links.lock().await.remove(&task_id);
                Err(e)
            }
        }
    }

    /// Cancel a task. Running tasks are finalized by the dispatcher within
    /// the grace period.
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, QueueError> {
        self.queue.cancel(task_id).await
    }

    /// Stop dispatching, cancel in-flight work and wait for the loop to
    /// exit.
    pub async fn shutdown(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        if self.control.send(Control::Shutdown).is_err() {
            warn!("Dispatcher already stopped");
        }
        if let Err(e) = handle.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
        info!("Scheduler shut down");
    }
}
