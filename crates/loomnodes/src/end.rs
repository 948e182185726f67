use std::collections::HashMap;

use async_trait::async_trait;
use loomcore::{
    EndOutputType, NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value,
};

/// Assembles the run's final output. The value lands in the `result`
/// field; the dispatcher copies it to the run record when the node
/// completes.
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::End
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::End(config) = &ctx.node.config else {
            return Err(NodeError::Config("end node with non-end config".into()));
        };

        let result = match config.output_type {
            EndOutputType::Variable => {
                let path = config.output_variable.as_deref().ok_or_else(|| {
                    NodeError::Config("end node output_variable is not set".into())
                })?;
                ctx.vars.get(path).cloned().unwrap_or(Value::Null)
            }
            EndOutputType::Template => {
                let template = config.output_template.as_deref().unwrap_or("");
                Value::String(ctx.render(template))
            }
            EndOutputType::Structured => {
                let fields: HashMap<String, Value> = config
                    .output_structure
                    .iter()
                    .map(|field| (field.key.clone(), Value::String(ctx.render(&field.value))))
                    .collect();
                Value::Object(fields)
            }
        };

        Ok(NodeOutput::new().with_output("result", result))
    }
}
