//! Agent execution.
//!
//! - `executor`: the executor seam and content block types
//! - `adapter`: runs one task and converts output into protocol events
//! - `classify`: maps error text onto client error codes
//! - `process`: executor backed by an agent CLI subprocess

pub mod adapter;
pub mod classify;
pub mod executor;
pub mod process;

pub use adapter::{ExecutionAdapter, ExecutionOutcome, RunCounters};
pub use classify::classify;
pub use executor::{
    AgentExecutor, AgentMessage, AgentStream, ContentBlock, ExecutionOptions, ExecutionRequest,
    ScriptedExecutor, Usage,
};
pub use process::ProcessExecutor;
