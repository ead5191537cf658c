//! Task queue.
//!
//! - `model`: task record, priorities and the status state machine
//! - `queue`: priority queue with concurrency ceiling and timeout watchdogs

pub mod model;
pub mod queue;

pub use model::{NewTask, Task, TaskFilter, TaskId, TaskPriority, TaskStatus};
pub use queue::{CancelOutcome, QueueEvent, QueueStats, RunTicket, TaskQueue, spawn_sweeper};
