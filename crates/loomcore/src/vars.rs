use crate::graph::{NodeConfig, NodeId, VarType};
use crate::validate::ValidatedWorkflow;
use crate::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// A variable some upstream node exposes, addressable in templates as
/// `{{reference_key.field}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub node_id: NodeId,
    pub reference_key: String,
    pub field: String,
    pub var_type: VarType,
    pub full_path: String,
}

/// Fixed per-kind output schema. Start nodes expose their declared input
/// variables; everything else exposes a known field set.
pub fn exposed_fields(config: &NodeConfig) -> Vec<(String, VarType)> {
    match config {
        NodeConfig::Start(c) => c
            .input_variables
            .iter()
            .map(|v| (v.name.clone(), v.var_type))
            .collect(),
        NodeConfig::Llm(_) | NodeConfig::Agent(_) => {
            vec![("text".to_string(), VarType::String)]
        }
        NodeConfig::Api(_) => vec![
            ("body".to_string(), VarType::String),
            ("status_code".to_string(), VarType::Number),
            ("headers".to_string(), VarType::Object),
        ],
        NodeConfig::Tool(_) => vec![("result".to_string(), VarType::String)],
        NodeConfig::Classifier(_) => vec![
            ("category_id".to_string(), VarType::String),
            ("category_name".to_string(), VarType::String),
        ],
        NodeConfig::Condition(_) => vec![("result".to_string(), VarType::Boolean)],
        NodeConfig::End(_) | NodeConfig::Parallel(_) => Vec::new(),
    }
}

/// Variables visible from `node_id`: the outputs of all its strict
/// ancestors, keyed by ancestor node id.
pub fn available_variables(
    workflow: &ValidatedWorkflow,
    node_id: &str,
) -> HashMap<NodeId, Vec<Variable>> {
    let mut result = HashMap::new();
    for ancestor_id in workflow.strict_ancestors(node_id) {
        let Some(node) = workflow.node(&ancestor_id) else {
            continue;
        };
        let variables = exposed_fields(&node.config)
            .into_iter()
            .map(|(field, var_type)| Variable {
                node_id: ancestor_id.clone(),
                reference_key: node.reference_key.clone(),
                full_path: format!("{}.{}", node.reference_key, field),
                field,
                var_type,
            })
            .collect();
        result.insert(ancestor_id, variables);
    }
    result
}

/// Flat set of `reference_key.field` paths visible from `node_id`.
pub fn ancestor_paths(workflow: &ValidatedWorkflow, node_id: &str) -> Vec<String> {
    available_variables(workflow, node_id)
        .into_values()
        .flat_map(|vars| vars.into_iter().map(|v| v.full_path))
        .collect()
}

/// Per-run variable store: `reference_key -> field -> value`. Append-only
/// within a run; the dispatch loop is the single writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableStore {
    values: HashMap<String, HashMap<String, Value>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a `reference_key.field` path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (reference_key, field) = path.split_once('.')?;
        self.values.get(reference_key)?.get(field)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn insert(&mut self, reference_key: &str, field: &str, value: Value) {
        self.values
            .entry(reference_key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    pub fn insert_outputs(&mut self, reference_key: &str, outputs: HashMap<String, Value>) {
        for (field, value) in outputs {
            self.insert(reference_key, &field, value);
        }
    }

    pub fn reference_keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("template token regex"))
}

/// Render `{{reference_key.field}}` tokens against the store. A token with
/// no recorded value (e.g. the producing node was skipped) renders as an
/// empty string with a logged warning; rendering never fails.
pub fn render_template(template: &str, store: &VariableStore) -> String {
    token_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps[1].trim();
            match store.get(path) {
                Some(value) => value.to_display(),
                None => {
                    tracing::warn!(path, "unresolved template reference, rendering empty");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Recursively render templates inside strings, arrays, and objects.
pub fn resolve_value(value: &Value, store: &VariableStore) -> Value {
    match value {
        Value::String(s) => Value::String(render_template(s, store)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, store)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, store)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Extract the (trimmed) paths of every template token in a string.
pub fn template_references(text: &str) -> Vec<String> {
    token_re()
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VariableStore {
        let mut store = VariableStore::new();
        store.insert("user", "name", Value::from("Alice"));
        store.insert("api_1", "status_code", Value::from(200i64));
        store
    }

    #[test]
    fn renders_known_tokens() {
        let rendered = render_template("Hi {{user.name}}: {{api_1.status_code}}", &store());
        assert_eq!(rendered, "Hi Alice: 200");
    }

    #[test]
    fn missing_token_renders_empty() {
        let rendered = render_template("[{{nope.field}}]", &store());
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn rendering_is_idempotent_for_unchanged_store() {
        let store = store();
        let template = "{{user.name}} / {{missing.var}} / literal";
        assert_eq!(
            render_template(template, &store),
            render_template(template, &store)
        );
    }

    #[test]
    fn resolve_value_recurses() {
        let value = Value::Object(HashMap::from([
            ("greeting".to_string(), Value::from("Hi {{user.name}}")),
            (
                "list".to_string(),
                Value::Array(vec![Value::from("{{api_1.status_code}}"), Value::from(1i64)]),
            ),
        ]));
        let resolved = resolve_value(&value, &store());
        match resolved {
            Value::Object(map) => {
                assert_eq!(map["greeting"], Value::from("Hi Alice"));
                assert_eq!(
                    map["list"],
                    Value::Array(vec![Value::from("200"), Value::from(1i64)])
                );
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn extracts_references() {
        let refs = template_references("a {{ x.y }} b {{p.q}}");
        assert_eq!(refs, vec!["x.y", "p.q"]);
    }
}
