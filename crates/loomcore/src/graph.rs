use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;

/// Node ids come from the editor collaborator and are opaque strings.
pub type NodeId = String;

/// Complete workflow definition as authored in the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(WorkflowEdge {
            source: source.into(),
            target: target.into(),
            branch: None,
        });
    }

    /// Connect with a branch label; the edge only activates when the source
    /// (a condition or classifier) produces that branch.
    pub fn connect_branch(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        branch: impl Into<String>,
    ) {
        self.edges.push(WorkflowEdge {
            source: source.into(),
            target: target.into(),
            branch: Some(branch.into()),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.kind() == NodeKind::Start)
    }
}

/// A node in a workflow. The per-kind configuration is flattened so the
/// JSON shape stays `{id, type, reference_key, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub reference_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub join: JoinPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub config: NodeConfig,
}

impl WorkflowNode {
    pub fn new(
        id: impl Into<NodeId>,
        reference_key: impl Into<String>,
        config: NodeConfig,
    ) -> Self {
        Self {
            id: id.into(),
            reference_key: reference_key.into(),
            label: None,
            timeout_secs: None,
            retry: None,
            join: JoinPolicy::default(),
            position: None,
            config,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    pub fn with_join(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Retry policy in effect for this node: explicit override, otherwise
    /// the default for its kind.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(|| self.kind().default_retry())
    }
}

/// Directed dependency between two nodes, optionally tagged with the
/// branch value that must be produced for the edge to activate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowEdge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// How a node with several predecessors joins them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Ready once all predecessors are terminal and at least one incoming
    /// edge carries a success.
    #[default]
    Any,
    /// Ready only if every incoming edge carries a success.
    All,
}

/// Closed set of node kinds. One executor exists per kind; there is no
/// open string-keyed registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Llm,
    Api,
    Condition,
    Classifier,
    Parallel,
    Agent,
    Tool,
}

impl NodeKind {
    pub const ALL: [NodeKind; 9] = [
        NodeKind::Start,
        NodeKind::End,
        NodeKind::Llm,
        NodeKind::Api,
        NodeKind::Condition,
        NodeKind::Classifier,
        NodeKind::Parallel,
        NodeKind::Agent,
        NodeKind::Tool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Llm => "llm",
            NodeKind::Api => "api",
            NodeKind::Condition => "condition",
            NodeKind::Classifier => "classifier",
            NodeKind::Parallel => "parallel",
            NodeKind::Agent => "agent",
            NodeKind::Tool => "tool",
        }
    }

    /// Kinds that call out to an external capability get retries by default;
    /// structural kinds run once.
    pub fn default_retry(&self) -> RetryPolicy {
        match self {
            NodeKind::Llm
            | NodeKind::Api
            | NodeKind::Classifier
            | NodeKind::Agent
            | NodeKind::Tool => RetryPolicy::default(),
            _ => RetryPolicy::none(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind node configuration, tagged by `type` in the workflow JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    Start(StartConfig),
    End(EndConfig),
    Llm(LlmConfig),
    Api(ApiConfig),
    Condition(ConditionConfig),
    Classifier(ClassifierConfig),
    Parallel(ParallelConfig),
    Agent(AgentConfig),
    Tool(ToolConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Start(_) => NodeKind::Start,
            NodeConfig::End(_) => NodeKind::End,
            NodeConfig::Llm(_) => NodeKind::Llm,
            NodeConfig::Api(_) => NodeKind::Api,
            NodeConfig::Condition(_) => NodeKind::Condition,
            NodeConfig::Classifier(_) => NodeKind::Classifier,
            NodeConfig::Parallel(_) => NodeKind::Parallel,
            NodeConfig::Agent(_) => NodeKind::Agent,
            NodeConfig::Tool(_) => NodeKind::Tool,
        }
    }

    /// Every string in the config that may contain `{{ref.field}}` tokens,
    /// plus bare variable paths (condition variables, end output variables).
    /// Used by the validator to check template ancestry.
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut templates: Vec<&str> = Vec::new();
        let mut bare: Vec<String> = Vec::new();
        match self {
            NodeConfig::Start(_) | NodeConfig::Parallel(_) => {}
            NodeConfig::End(c) => {
                if let Some(var) = &c.output_variable {
                    bare.push(var.clone());
                }
                if let Some(t) = &c.output_template {
                    templates.push(t);
                }
                for field in &c.output_structure {
                    templates.push(&field.value);
                }
            }
            NodeConfig::Llm(c) => {
                if let Some(s) = &c.system_prompt {
                    templates.push(s);
                }
                templates.push(&c.user_prompt);
            }
            NodeConfig::Api(c) => {
                templates.push(&c.url);
                for kv in c.headers.iter().chain(&c.params).chain(&c.form_url_encoded) {
                    templates.push(&kv.key);
                    templates.push(&kv.value);
                }
                if let Some(b) = &c.body {
                    templates.push(b);
                }
            }
            NodeConfig::Condition(c) => {
                if let Some(var) = &c.variable {
                    bare.push(var.clone());
                }
                if let Some(e) = &c.expression {
                    templates.push(e);
                }
                if let Some(v) = &c.compare_value {
                    templates.push(v);
                }
                if let Some(p) = &c.llm_prompt {
                    templates.push(p);
                }
            }
            NodeConfig::Classifier(c) => templates.push(&c.input),
            NodeConfig::Agent(c) => templates.push(&c.input),
            NodeConfig::Tool(c) => {
                for value in c.arguments.values() {
                    collect_value_templates(value, &mut bare);
                }
            }
        }
        for t in templates {
            bare.extend(crate::vars::template_references(t));
        }
        bare
    }
}

fn collect_value_templates(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(crate::vars::template_references(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_value_templates(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_value_templates(v, out)),
        _ => {}
    }
}

/// Declared type of a variable exposed by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default)]
    pub input_variables: Vec<InputVariable>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOutputType {
    #[default]
    Variable,
    Template,
    Structured,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndConfig {
    #[serde(default)]
    pub output_type: EndOutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_template: Option<String>,
    #[serde(default)]
    pub output_structure: Vec<OutputField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    #[default]
    None,
    Json,
    Raw,
    #[serde(alias = "x-www-form-urlencoded")]
    FormUrlEncoded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub form_url_encoded: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    #[default]
    Variable,
    Expression,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub condition_type: ConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<ConditionOperator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Template producing the text to classify.
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Template producing the message sent to the agent.
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Argument values may contain templates anywhere inside.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

/// Retry policy for node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the given retry attempt (attempt 1 is the first retry).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

/// Node position in the visual editor. Carried through untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Global workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Run-level deadline, enforced by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_time_ms: Option<u64>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_nodes: usize,
}

fn default_max_parallel() -> usize {
    10
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_run_time_ms: None,
            max_parallel_nodes: default_max_parallel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_json_shape_is_flat() {
        let json = serde_json::json!({
            "id": "c1",
            "type": "condition",
            "reference_key": "check",
            "condition_type": "expression",
            "expression": "{{a.status_code}} == 200"
        });
        let node: WorkflowNode = serde_json::from_value(json).unwrap();
        assert_eq!(node.kind(), NodeKind::Condition);
        assert_eq!(node.reference_key, "check");
        match &node.config {
            NodeConfig::Condition(c) => {
                assert_eq!(c.condition_type, ConditionType::Expression);
                assert_eq!(c.expression.as_deref(), Some("{{a.status_code}} == 200"));
            }
            other => panic!("wrong config: {other:?}"),
        }
    }

    #[test]
    fn referenced_paths_cover_templates_and_bare_variables() {
        let config = NodeConfig::Condition(ConditionConfig {
            condition_type: ConditionType::Variable,
            variable: Some("api_1.status_code".into()),
            operator: Some(ConditionOperator::Equals),
            compare_value: Some("{{start.expected}}".into()),
            ..Default::default()
        });
        let mut paths = config.referenced_paths();
        paths.sort();
        assert_eq!(paths, vec!["api_1.status_code", "start.expected"]);
    }

    #[test]
    fn referenced_paths_cover_api_keys_and_values() {
        let config = NodeConfig::Api(ApiConfig {
            method: HttpMethod::Get,
            url: "https://example.com/{{start.path}}".into(),
            headers: vec![KeyValue {
                key: "X-{{start.header_name}}".into(),
                value: "{{start.header_value}}".into(),
            }],
            params: vec![KeyValue {
                key: "{{start.param_name}}".into(),
                value: "fixed".into(),
            }],
            body_type: BodyType::None,
            body: None,
            form_url_encoded: Vec::new(),
        });
        let mut paths = config.referenced_paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "start.header_name",
                "start.header_value",
                "start.param_name",
                "start.path",
            ]
        );
    }

    #[test]
    fn backoff_grows() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1).as_millis(), 100);
        assert_eq!(policy.delay_for(2).as_millis(), 200);
    }
}
