//! Workflow execution runtime.
//!
//! Per-run state and trace recording, the topological scheduler, the
//! bounded async dispatcher, and the runtime facade that exposes
//! submit/status/trace/cancel to the outer surfaces.

mod context;
mod executor;
mod runtime;
mod scheduler;

pub use context::{NodeExecutionRecord, NodeStatus, RunSnapshot, RunState, RunStatus};
pub use executor::RunExecutor;
pub use runtime::{RuntimeConfig, WorkflowRuntime, WorkflowSummary};
pub use scheduler::Scheduler;
