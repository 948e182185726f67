//! Core abstractions for the loom workflow engine.
//!
//! This crate holds the graph model and validator, the variable resolver,
//! the node-executor contract, and the error taxonomy that every other
//! component depends on.

mod error;
mod events;
mod graph;
mod node;
mod validate;
mod value;
pub mod vars;

pub use error::{EngineError, NodeError, RenderError, ValidationError, ValidationReport};
pub use events::{EventBus, EventEmitter, ExecutionEvent, RunId};
pub use graph::{
    AgentConfig, ApiConfig, BodyType, Category, ClassifierConfig, ConditionConfig,
    ConditionOperator, ConditionType, EndConfig, EndOutputType, HttpMethod, InputVariable,
    JoinPolicy, KeyValue, LlmConfig, NodeConfig, NodeId, NodeKind, OutputField, ParallelConfig,
    Position, RetryPolicy, StartConfig, ToolConfig, VarType, Workflow, WorkflowEdge, WorkflowId,
    WorkflowNode, WorkflowSettings,
};
pub use node::{ExecutorSet, NodeContext, NodeExecutor, NodeOutput};
pub use validate::{validate, ValidatedWorkflow};
pub use value::Value;
pub use vars::{
    available_variables, exposed_fields, render_template, resolve_value, template_references,
    Variable, VariableStore,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
