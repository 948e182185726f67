use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use loomcore::{NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value};

use crate::capability::AgentHost;

/// Invokes a hosted tool. Argument values are resolved against the
/// variable store before the call, so both template strings and bare
/// reference paths work.
pub struct ToolExecutor {
    host: Arc<dyn AgentHost>,
}

impl ToolExecutor {
    pub fn new(host: Arc<dyn AgentHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl NodeExecutor for ToolExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Tool(config) = &ctx.node.config else {
            return Err(NodeError::Config("tool node with non-tool config".into()));
        };

        let resolved: HashMap<String, Value> = config
            .arguments
            .iter()
            .map(|(key, value)| (key.clone(), ctx.resolve(value)))
            .collect();
        let arguments = Value::Object(resolved).to_json();

        let result = self.host.run_tool(&config.tool_id, arguments).await?;
        Ok(NodeOutput::new().with_output("result", result))
    }
}
