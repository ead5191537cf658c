//! Dispatch: the bridge between the task queue and the worker pool.
//!
//! - `scheduler`: public handle for submitting and cancelling tasks
//! - `dispatcher`: the single-writer loop that starts and finalizes them

mod dispatcher;
pub mod scheduler;

pub use dispatcher::Control;
pub use scheduler::Scheduler;
