use std::sync::Arc;

use async_trait::async_trait;
use loomcore::{NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};

use crate::capability::AgentHost;

/// Delegates a rendered message to an agent hosted on the platform and
/// exposes the reply as `text`.
pub struct AgentExecutor {
    host: Arc<dyn AgentHost>,
}

impl AgentExecutor {
    pub fn new(host: Arc<dyn AgentHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Agent(config) = &ctx.node.config else {
            return Err(NodeError::Config("agent node with non-agent config".into()));
        };

        let message = ctx.render(&config.input);
        let text = self.host.run_agent(&config.agent_id, &message).await?;
        Ok(NodeOutput::new().with_output("text", text))
    }
}
