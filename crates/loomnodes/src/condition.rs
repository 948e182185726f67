use std::sync::Arc;

use async_trait::async_trait;
use loomcore::{
    ConditionOperator, ConditionType, NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind,
    NodeOutput, Value,
};

use crate::capability::{ChatRequest, LlmClient};

/// Evaluates a boolean test and produces a `true`/`false` branch label.
/// Three modes: a variable compared against a literal, a rendered binary
/// comparison expression, or a yes/no question put to the LLM.
pub struct ConditionExecutor {
    llm: Arc<dyn LlmClient>,
}

impl ConditionExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Condition(config) = &ctx.node.config else {
            return Err(NodeError::Config(
                "condition node with non-condition config".into(),
            ));
        };

        let result = match config.condition_type {
            ConditionType::Variable => {
                let path = config.variable.as_deref().ok_or_else(|| {
                    NodeError::Config("condition node variable is not set".into())
                })?;
                let operator = config.operator.unwrap_or(ConditionOperator::Equals);
                let compare = config
                    .compare_value
                    .as_deref()
                    .map(|v| ctx.render(v))
                    .unwrap_or_default();
                apply_operator(ctx.vars.get(path), operator, &compare)
            }
            ConditionType::Expression => {
                let expression = config.expression.as_deref().ok_or_else(|| {
                    NodeError::Config("condition node expression is not set".into())
                })?;
                evaluate_comparison(&ctx.render(expression))?
            }
            ConditionType::Llm => {
                let prompt = config.llm_prompt.as_deref().ok_or_else(|| {
                    NodeError::Config("condition node llm_prompt is not set".into())
                })?;
                let request = ChatRequest {
                    model: config.model.clone(),
                    system_prompt: Some(
                        "Answer the following question with exactly 'true' or 'false'."
                            .to_string(),
                    ),
                    user_prompt: ctx.render(prompt),
                    temperature: 0.0,
                    max_tokens: 10,
                };
                let reply = self.llm.chat(request).await?;
                reply.to_lowercase().contains("true")
            }
        };

        let branch = if result { "true" } else { "false" };
        Ok(NodeOutput::new()
            .with_output("result", result)
            .with_branch(branch))
    }
}

fn apply_operator(value: Option<&Value>, operator: ConditionOperator, compare: &str) -> bool {
    let display = value.map(Value::to_display).unwrap_or_default();
    match operator {
        ConditionOperator::Equals => display == compare,
        ConditionOperator::NotEquals => display != compare,
        ConditionOperator::Contains => display.contains(compare),
        ConditionOperator::GreaterThan => match numeric_pair(&display, compare) {
            Some((lhs, rhs)) => lhs > rhs,
            None => display.as_str() > compare,
        },
        ConditionOperator::LessThan => match numeric_pair(&display, compare) {
            Some((lhs, rhs)) => lhs < rhs,
            None => display.as_str() < compare,
        },
        ConditionOperator::IsEmpty => value.map(Value::is_empty).unwrap_or(true),
        ConditionOperator::IsNotEmpty => !value.map(Value::is_empty).unwrap_or(true),
    }
}

/// Evaluates a fully rendered `lhs <op> rhs` comparison. Operands compare
/// numerically when both sides parse as numbers, as strings otherwise.
fn evaluate_comparison(expression: &str) -> Result<bool, NodeError> {
    // Two-character operators must be tried before their one-character prefixes.
    const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
    for token in OPERATORS {
        let Some((lhs, rhs)) = expression.split_once(token) else {
            continue;
        };
        let lhs = strip_quotes(lhs.trim());
        let rhs = strip_quotes(rhs.trim());
        let result = match numeric_pair(lhs, rhs) {
            Some((a, b)) => match token {
                "==" => a == b,
                "!=" => a != b,
                ">=" => a >= b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a < b,
            },
            None => match token {
                "==" => lhs == rhs,
                "!=" => lhs != rhs,
                ">=" => lhs >= rhs,
                "<=" => lhs <= rhs,
                ">" => lhs > rhs,
                _ => lhs < rhs,
            },
        };
        return Ok(result);
    }
    Err(NodeError::Config(format!(
        "unsupported condition expression '{expression}'"
    )))
}

fn numeric_pair(lhs: &str, rhs: &str) -> Option<(f64, f64)> {
    Some((lhs.trim().parse().ok()?, rhs.trim().parse().ok()?))
}

fn strip_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison() {
        assert!(evaluate_comparison("200 == 200").unwrap());
        assert!(evaluate_comparison("3 >= 2.5").unwrap());
        assert!(!evaluate_comparison("1 > 2").unwrap());
    }

    #[test]
    fn string_comparison_with_quotes() {
        assert!(evaluate_comparison("'hello' == hello").unwrap());
        assert!(evaluate_comparison("\"a\" != \"b\"").unwrap());
    }

    #[test]
    fn unsupported_expression_is_config_error() {
        let error = evaluate_comparison("just words").unwrap_err();
        assert!(matches!(error, NodeError::Config(_)));
    }

    #[test]
    fn operators_on_missing_value() {
        assert!(apply_operator(None, ConditionOperator::IsEmpty, ""));
        assert!(!apply_operator(None, ConditionOperator::IsNotEmpty, ""));
        assert!(apply_operator(None, ConditionOperator::Equals, ""));
    }

    #[test]
    fn contains_operator() {
        let value = Value::String("hello world".into());
        assert!(apply_operator(
            Some(&value),
            ConditionOperator::Contains,
            "world"
        ));
    }
}
