use std::sync::Arc;

use async_trait::async_trait;
use loomcore::{NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};

use crate::capability::{ChatRequest, LlmClient};

/// Routes execution by asking the LLM to pick one of the configured
/// categories. The chosen category id becomes the branch label; when the
/// reply cannot be parsed the first category is used as the fallback.
pub struct ClassifierExecutor {
    llm: Arc<dyn LlmClient>,
}

impl ClassifierExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl NodeExecutor for ClassifierExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Classifier
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Classifier(config) = &ctx.node.config else {
            return Err(NodeError::Config(
                "classifier node with non-classifier config".into(),
            ));
        };
        if config.categories.is_empty() {
            return Err(NodeError::Config(
                "classifier node has no categories".into(),
            ));
        }

        let listing = config
            .categories
            .iter()
            .map(|c| format!("- {}: {} ({})", c.id, c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let input = ctx.render(&config.input);
        let request = ChatRequest {
            model: config.model.clone(),
            system_prompt: Some(
                "You are a classifier. Reply with JSON of the form {\"category_id\": \"...\"} \
                 and nothing else."
                    .to_string(),
            ),
            user_prompt: format!(
                "Categories:\n{listing}\n\nClassify this input:\n{input}"
            ),
            temperature: 0.0,
            max_tokens: 100,
        };

        let reply = self.llm.chat(request).await?;
        let chosen = extract_category_id(&reply)
            .and_then(|id| config.categories.iter().find(|c| c.id == id))
            .unwrap_or(&config.categories[0]);

        Ok(NodeOutput::new()
            .with_output("category_id", chosen.id.clone())
            .with_output("category_name", chosen.name.clone())
            .with_branch(chosen.id.clone()))
    }
}

/// Pulls the category id out of a reply that may wrap the JSON in prose
/// or code fences.
fn extract_category_id(reply: &str) -> Option<String> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    let parsed: serde_json::Value = serde_json::from_str(&reply[start..=end]).ok()?;
    parsed["category_id"].as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_json() {
        let id = extract_category_id(r#"{"category_id": "billing"}"#);
        assert_eq!(id.as_deref(), Some("billing"));
    }

    #[test]
    fn extracts_from_fenced_reply() {
        let reply = "Sure!\n```json\n{\"category_id\": \"support\"}\n```";
        assert_eq!(extract_category_id(reply).as_deref(), Some("support"));
    }

    #[test]
    fn garbage_reply_yields_none() {
        assert_eq!(extract_category_id("no json here"), None);
    }
}
