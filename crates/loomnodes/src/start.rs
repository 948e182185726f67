use async_trait::async_trait;
use loomcore::{NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value};

/// Publishes the run's input values under the start node's reference key.
/// The dispatcher seeds the store before the run begins; this executor
/// re-emits the declared variables so the trace records them like any
/// other node output.
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Start
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Start(config) = &ctx.node.config else {
            return Err(NodeError::Config("start node with non-start config".into()));
        };

        let mut output = NodeOutput::new();
        for var in &config.input_variables {
            let path = format!("{}.{}", ctx.node.reference_key, var.name);
            let value = ctx.vars.get(&path).cloned().unwrap_or(Value::Null);
            output.outputs.insert(var.name.clone(), value);
        }
        Ok(output)
    }
}
