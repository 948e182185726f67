use crate::events::EventEmitter;
use crate::graph::{NodeKind, WorkflowNode};
use crate::vars::{render_template, resolve_value, VariableStore};
use crate::{NodeError, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Contract every node executor implements. There is exactly one executor
/// per [`NodeKind`].
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Execute the node against a snapshot of the run's variables.
    /// Outputs are written to the store by the dispatcher, never here.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context handed to a node executor. Owns clones so the
/// executor can run on a spawned task.
#[derive(Clone)]
pub struct NodeContext {
    pub node: WorkflowNode,

    /// Snapshot of the variable store taken when the node became ready.
    /// Every variable the node references is already recorded (or was
    /// recorded as skipped) by then.
    pub vars: VariableStore,

    pub events: EventEmitter,
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    pub fn render(&self, template: &str) -> String {
        render_template(template, &self.vars)
    }

    pub fn resolve(&self, value: &Value) -> Value {
        resolve_value(value, &self.vars)
    }
}

/// Output of one node execution.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Field values exposed under the node's reference key.
    pub outputs: HashMap<String, Value>,

    /// Branch label produced by condition/classifier nodes; selects which
    /// outgoing edges activate.
    pub branch: Option<String>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(field.into(), value.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Closed mapping from node kind to its executor.
#[derive(Default)]
pub struct ExecutorSet {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        NodeKind::ALL
            .into_iter()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }
}
