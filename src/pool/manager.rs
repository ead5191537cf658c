//! Elastic worker pool.
//!
//! The worker map is only mutated through `WorkerPool` methods. Provider
//! calls happen outside the lock; in-flight provisions are tracked so they
//! count toward `max_workers`.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::model::{Worker, WorkerId, WorkerState};
use super::provisioner::{Provisioner, RemoteState};
use crate::config::PoolConfig;
use crate::error::{PoolError, ProvisionError};
use crate::tasks::TaskId;

/// Notifications from the pool to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker gained spare capacity (new, or a task was released).
    WorkerReady(WorkerId),
    /// A worker vanished; its tasks will never report back.
    WorkerLost {
        worker_id: WorkerId,
        tasks: Vec<TaskId>,
    },
}

/// What a scaling pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Noop,
    ScaledUp(WorkerId),
    ScaledDown(WorkerId),
    ProvisionFailed,
    /// Scale-up wanted but provisioning is backing off.
    BackingOff,
    /// Destroy failed; the worker stays draining and is retried next tick.
    DestroyFailed(WorkerId),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub draining: usize,
    pub pending_provisions: usize,
    pub running_tasks: usize,
    pub total_capacity: usize,
    pub utilization: f64,
}

// ── Provisioning backoff ────────────────────────────────────────────

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Exponential delay capped at `max`, plus up to 25% jitter.
    fn record_failure(&mut self, base: Duration, max: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exp = base
            .saturating_mul(2u32.saturating_pow(self.failures - 1))
            .min(max);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
        let delay = exp + Duration::from_millis(jitter_ms);
        self.retry_at = Some(Instant::now() + delay);
        delay
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Pool state ──────────────────────────────────────────────────────

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, Worker>,
    pending_provisions: usize,
    next_id: u64,
    backoff: Backoff,
    /// Work asked for a worker and none has taken it yet.
    unmet_demand: bool,
    shutting_down: bool,
}

impl PoolState {
    fn active(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values().filter(|w| !w.is_draining())
    }

    fn active_count(&self) -> usize {
        self.active().count()
    }

    fn has_spare_capacity(&self) -> bool {
        self.active().any(Worker::has_capacity)
    }

    /// Running tasks over total capacity of non-draining workers.
    fn utilization(&self) -> f64 {
        let capacity: usize = self.active().map(|w| w.capacity).sum();
        let running: usize = self.active().map(Worker::running_task_count).sum();
        if capacity == 0 {
            return if running > 0 { 1.0 } else { 0.0 };
        }
        running as f64 / capacity as f64
    }
}

enum Plan {
    Destroy { id: WorkerId, handle: String },
    Provision,
    Skip(ScaleAction),
}

/// Owns worker lifecycle and the auto-scaling control loop.
pub struct WorkerPool {
    config: PoolConfig,
    provisioner: Arc<dyn Provisioner>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            provisioner,
            state: Mutex::new(PoolState::default()),
            events,
        });
        (pool, events_rx)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Provision `min_workers` before any dispatch is accepted.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let needed = {
            let mut state = self.state.lock().await;
            let needed = self
                .config
                .min_workers
                .saturating_sub(state.active_count() + state.pending_provisions);
            state.pending_provisions += needed;
            needed
        };

        let results = futures::future::join_all((0..needed).map(|_| self.provision_one())).await;
        if let Some(e) = results.into_iter().find_map(Result::err) {
            return Err(PoolError::Initialization(e));
        }

        info!(
            workers = needed,
            provider = self.provisioner.name(),
            "Worker pool initialized"
        );
        Ok(())
    }

    /// Create one worker. The caller must have reserved a pending slot.
    async fn provision_one(&self) -> Result<WorkerId, ProvisionError> {
        let result = self.provisioner.create().await;

        let mut state = self.state.lock().await;
        state.pending_provisions = state.pending_provisions.saturating_sub(1);

        let provisioned = match result {
            Ok(p) => p,
            Err(e) => {
                let delay = state.backoff.record_failure(
                    self.config.provision_backoff_base,
                    self.config.provision_backoff_max,
                );
                warn!(
                    error = %e,
                    failures = state.backoff.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Worker provisioning failed"
                );
                return Err(e);
            }
        };

        if state.shutting_down {
            drop(state);
            if let Err(e) = self.provisioner.destroy(&provisioned.handle).await {
                warn!(error = %e, "Failed to destroy worker created during shutdown");
            }
            return Err(ProvisionError::CreateFailed {
                reason: "pool is shutting down".to_string(),
            });
        }

        state.backoff.reset();
        state.unmet_demand = false;
        state.next_id += 1;
        let id = format!("worker-{}", state.next_id);
        let worker = Worker::new(
            id.clone(),
            provisioned.handle,
            provisioned.address,
            self.config.per_worker_capacity,
        );
        info!(worker_id = %id, address = %worker.address, "Worker provisioned");
        state.workers.insert(id.clone(), worker);
        drop(state);

        self.emit(PoolEvent::WorkerReady(id.clone()));
        Ok(id)
    }

    /// Reserve a provisioning slot if the pool may grow right now. When
    /// `demand` is set and no slot is free, the tick keeps retrying.
    async fn reserve_provision(&self, demand: bool) -> bool {
        let mut state = self.state.lock().await;
        if demand && !state.shutting_down {
            state.unmet_demand = true;
        }
        if state.shutting_down
            || state.active_count() + state.pending_provisions >= self.config.max_workers
            || !state.backoff.ready(Instant::now())
        {
            return false;
        }
        state.pending_provisions += 1;
        true
    }

    /// Escape hatch: provision one worker now, bypassing the tick.
    /// Returns `None` when the pool is at max or backing off.
    pub async fn scale_up_now(&self) -> Result<Option<WorkerId>, ProvisionError> {
        if !self.reserve_provision(false).await {
            return Ok(None);
        }
        self.provision_one().await.map(Some)
    }

    /// Escape hatch without waiting. The new worker announces itself with
    /// `PoolEvent::WorkerReady`. If provisioning fails or is backing off,
    /// later ticks keep trying until a task takes a worker.
    pub async fn request_scale_up(self: &Arc<Self>) -> bool {
        if !self.reserve_provision(true).await {
            return false;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are logged and backed off inside provision_one.
            let _ = pool.provision_one().await;
        });
        true
    }

    /// Least-loaded non-draining worker with spare capacity, preferring the
    /// most recently active on ties.
    pub async fn get_available_worker(&self) -> Option<WorkerId> {
        let state = self.state.lock().await;
        state
            .workers
            .values()
            .filter(|w| w.has_capacity())
            .min_by_key(|w| (w.running_task_count(), Reverse(w.last_active())))
            .map(|w| w.id.clone())
    }

    pub async fn assign(&self, worker_id: &str, task_id: TaskId) -> Result<(), PoolError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.assign(task_id)?;
        state.unmet_demand = false;
        debug!(worker_id, task_id = %task_id, running = worker.running_task_count(), "Task assigned");
        Ok(())
    }

    pub async fn release(&self, worker_id: &str, task_id: TaskId) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.release(task_id)?;
        let ready = worker.has_capacity();
        debug!(worker_id, task_id = %task_id, running = worker.running_task_count(), "Task released");
        drop(state);

        if ready {
            self.emit(PoolEvent::WorkerReady(worker_id.to_string()));
        }
        Ok(())
    }

    // ── Scaling ─────────────────────────────────────────────────────

    /// One pass of the control loop. Changes at most one worker.
    pub async fn tick(&self) -> ScaleAction {
        let plan = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return ScaleAction::Noop;
            }
            self.evict_idle(&mut state);
            self.plan(&mut state)
        };

        match plan {
            Plan::Destroy { id, handle } => self.destroy_worker(id, handle).await,
            Plan::Provision => match self.provision_one().await {
                Ok(id) => ScaleAction::ScaledUp(id),
                Err(_) => ScaleAction::ProvisionFailed,
            },
            Plan::Skip(action) => action,
        }
    }

    /// Mark workers idle past `idle_timeout` as draining, never dropping
    /// the active count below `min_workers`.
    fn evict_idle(&self, state: &mut PoolState) {
        let spare = state.active_count().saturating_sub(self.config.min_workers);
        if spare == 0 {
            return;
        }

        let now = Instant::now();
        let mut expired: Vec<(Instant, WorkerId)> = state
            .active()
            .filter(|w| w.is_empty() && w.idle_for(now) >= self.config.idle_timeout)
            .map(|w| (w.last_active(), w.id.clone()))
            .collect();
        expired.sort();

        for (_, id) in expired.into_iter().take(spare) {
            if let Some(worker) = state.workers.get_mut(&id) {
                worker.mark_draining();
                info!(worker_id = %id, "Idle worker marked draining");
            }
        }
    }

    fn plan(&self, state: &mut PoolState) -> Plan {
        // Empty draining workers go first.
        if let Some(worker) = state
            .workers
            .values()
            .filter(|w| w.is_draining() && w.is_empty())
            .min_by_key(|w| w.last_active())
        {
            return Plan::Destroy {
                id: worker.id.clone(),
                handle: worker.handle.clone(),
            };
        }

        let active = state.active_count();
        let planned = active + state.pending_provisions;
        let utilization = state.utilization();

        if utilization < self.config.scale_down_threshold && active > self.config.min_workers {
            if let Some(worker) = state
                .workers
                .values_mut()
                .filter(|w| w.state == WorkerState::Idle)
                .min_by_key(|w| w.last_active())
            {
                worker.mark_draining();
                info!(worker_id = %worker.id, utilization, "Scaling down");
                return Plan::Destroy {
                    id: worker.id.clone(),
                    handle: worker.handle.clone(),
                };
            }
        }

        let below_min = planned < self.config.min_workers;
        let overloaded =
            utilization > self.config.scale_up_threshold && planned < self.config.max_workers;
        // Queued work with nowhere to run, e.g. after a failed escape hatch.
        let starved = state.unmet_demand
            && state.pending_provisions == 0
            && !state.has_spare_capacity()
            && planned < self.config.max_workers;
        if below_min || overloaded || starved {
            if !state.backoff.ready(Instant::now()) {
                return Plan::Skip(ScaleAction::BackingOff);
            }
            state.pending_provisions += 1;
            info!(utilization, workers = active, "Scaling up");
            return Plan::Provision;
        }

        Plan::Skip(ScaleAction::Noop)
    }

    async fn destroy_worker(&self, id: WorkerId, handle: String) -> ScaleAction {
        match self.provisioner.destroy(&handle).await {
            Ok(()) => {
                self.state.lock().await.workers.remove(&id);
                info!(worker_id = %id, "Worker destroyed");
                ScaleAction::ScaledDown(id)
            }
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Failed to destroy worker, retrying next tick");
                ScaleAction::DestroyFailed(id)
            }
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Reconcile bookkeeping with the provider. Returns how many workers
    /// were dropped.
    pub async fn health_check(&self) -> usize {
        let snapshot: Vec<(WorkerId, String)> = {
            let state = self.state.lock().await;
            state
                .workers
                .values()
                .map(|w| (w.id.clone(), w.handle.clone()))
                .collect()
        };

        let mut lost = Vec::new();
        for (id, handle) in snapshot {
            match self.provisioner.status(&handle).await {
                Ok(RemoteState::Running) => {}
                Ok(remote) => lost.push((id, handle, remote)),
                Err(e) => warn!(worker_id = %id, error = %e, "Worker status check failed"),
            }
        }

        let mut dropped = 0;
        for (id, handle, remote) in lost {
            let Some(worker) = self.state.lock().await.workers.remove(&id) else {
                continue;
            };
            dropped += 1;
            warn!(
                worker_id = %id,
                remote_state = ?remote,
                running = worker.running_task_count(),
                "Worker no longer running, dropped from pool"
            );

            if remote == RemoteState::Stopped {
                if let Err(e) = self.provisioner.destroy(&handle).await {
                    warn!(worker_id = %id, error = %e, "Failed to destroy stopped worker");
                }
            }

            self.emit(PoolEvent::WorkerLost {
                worker_id: id,
                tasks: worker.running_tasks.into_iter().collect(),
            });
        }
        dropped
    }

    /// Drain and destroy every worker. The pool accepts no work afterwards.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            state
                .workers
                .drain()
                .map(|(_, mut w)| {
                    w.mark_draining();
                    w
                })
                .collect()
        };

        let results =
            futures::future::join_all(workers.iter().map(|w| self.provisioner.destroy(&w.handle)))
                .await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                error!(worker_id = %worker.id, error = %e, "Failed to destroy worker on shutdown");
            }
        }

        info!(count = workers.len(), "Worker pool shut down");
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut stats = PoolStats {
            workers: state.workers.len(),
            pending_provisions: state.pending_provisions,
            utilization: state.utilization(),
            ..Default::default()
        };
        for worker in state.workers.values() {
            match worker.state {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Draining => stats.draining += 1,
            }
            stats.running_tasks += worker.running_task_count();
            if !worker.is_draining() {
                stats.total_capacity += worker.capacity;
            }
        }
        stats
    }

    pub async fn worker(&self, id: &str) -> Option<Worker> {
        self.state.lock().await.workers.get(id).cloned()
    }

    /// All workers, oldest first.
    pub async fn workers(&self) -> Vec<Worker> {
        let state = self.state.lock().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        workers
    }
}

/// Run the scaling tick and the health check on their intervals until the
/// pool shuts down.
pub fn spawn_maintenance(pool: Arc<WorkerPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut scale = tokio::time::interval(pool.config.scale_interval);
        let mut health = tokio::time::interval(pool.config.health_check_interval);
        scale.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the immediate first ticks; initialize() covers startup.
        scale.tick().await;
        health.tick().await;

        loop {
            tokio::select! {
                _ = scale.tick() => {
                    let action = pool.tick().await;
                    if action != ScaleAction::Noop {
                        debug!(?action, "Scaling tick");
                    }
                }
                _ = health.tick() => {
                    let dropped = pool.health_check().await;
                    if dropped > 0 {
                        info!(dropped, "Health check dropped workers");
                    }
                }
            }

            if pool.is_shut_down().await {
                break;
            }
        }
    })
}
