use std::sync::Arc;

use async_trait::async_trait;
use loomcore::{NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};

use crate::capability::{ChatRequest, LlmClient};

/// Renders the configured prompts against the variable store and runs a
/// chat completion. Exposes the reply as `text`.
pub struct LlmExecutor {
    llm: Arc<dyn LlmClient>,
}

impl LlmExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl NodeExecutor for LlmExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Llm
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Llm(config) = &ctx.node.config else {
            return Err(NodeError::Config("llm node with non-llm config".into()));
        };

        let request = ChatRequest {
            model: config.model.clone(),
            system_prompt: config.system_prompt.as_deref().map(|p| ctx.render(p)),
            user_prompt: ctx.render(&config.user_prompt),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let text = self.llm.chat(request).await?;
        Ok(NodeOutput::new().with_output("text", text))
    }
}
