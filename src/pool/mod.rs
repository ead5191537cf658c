//! Worker pool.
//!
//! - `model`: worker record and its idle/busy/draining state
//! - `provisioner`: seam to the compute provider, plus an in-process one
//! - `manager`: bookkeeping, auto-scaling and health checks

pub mod manager;
pub mod model;
pub mod provisioner;

pub use manager::{PoolEvent, PoolStats, ScaleAction, WorkerPool, spawn_maintenance};
pub use model::{Worker, WorkerId, WorkerState};
pub use provisioner::{LocalProvisioner, ProvisionedWorker, Provisioner, RemoteState};
