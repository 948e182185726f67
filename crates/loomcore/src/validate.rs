use crate::error::{RenderError, ValidationError, ValidationReport};
use crate::graph::{NodeId, NodeKind, Workflow, WorkflowEdge, WorkflowNode};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

fn reference_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("reference key regex"))
}

/// A workflow that has passed validation, plus the prebuilt adjacency
/// index every run shares read-only.
#[derive(Debug)]
pub struct ValidatedWorkflow {
    workflow: Workflow,
    graph: DiGraph<NodeId, Option<String>>,
    index_of: HashMap<NodeId, NodeIndex>,
    start_id: NodeId,
    unreachable: HashSet<NodeId>,
    warnings: Vec<String>,
}

impl ValidatedWorkflow {
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.workflow.find_node(id)
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.workflow.nodes
    }

    pub fn start_id(&self) -> &NodeId {
        &self.start_id
    }

    pub fn end_ids(&self) -> Vec<&NodeId> {
        self.workflow
            .nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::End)
            .map(|n| &n.id)
            .collect()
    }

    /// Nodes the validator warned about as unreachable from start; the
    /// scheduler marks these skipped without dispatching them.
    pub fn unreachable(&self) -> &HashSet<NodeId> {
        &self.unreachable
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn incoming_edges(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.workflow
            .edges
            .iter()
            .filter(|e| e.target == id)
            .collect()
    }

    pub fn successors(&self, id: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// All strict ancestors of a node: breadth-first over reversed edges,
    /// with a visited set so diamond shapes are collected once.
    pub fn strict_ancestors(&self, id: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(idx);
        while let Some(current) = queue.pop_front() {
            for parent in self.graph.neighbors_directed(current, Direction::Incoming) {
                if visited.insert(parent) {
                    order.push(self.graph[parent].clone());
                    queue.push_back(parent);
                }
            }
        }
        order
    }
}

/// Validate a workflow definition.
///
/// Structural problems (cycles, duplicate or malformed reference keys,
/// dangling edges, start/end cardinality) and template references to
/// non-ancestors are errors. Unreachable nodes are warnings only.
pub fn validate(workflow: Workflow) -> Result<ValidatedWorkflow, ValidationReport> {
    let mut errors = Vec::new();

    let mut seen_keys: HashMap<&str, &str> = HashMap::new();
    for node in &workflow.nodes {
        if !reference_key_re().is_match(&node.reference_key) {
            errors.push(ValidationError::InvalidReferenceKey {
                key: node.reference_key.clone(),
                node: node.id.clone(),
            });
        }
        if let Some(first) = seen_keys.insert(node.reference_key.as_str(), node.id.as_str()) {
            errors.push(ValidationError::DuplicateReferenceKey {
                key: node.reference_key.clone(),
                first: first.to_string(),
                second: node.id.clone(),
            });
        }
    }

    let mut graph: DiGraph<NodeId, Option<String>> = DiGraph::new();
    let mut index_of: HashMap<NodeId, NodeIndex> = HashMap::new();
    for node in &workflow.nodes {
        index_of.insert(node.id.clone(), graph.add_node(node.id.clone()));
    }
    for edge in &workflow.edges {
        match (index_of.get(&edge.source), index_of.get(&edge.target)) {
            (Some(&source), Some(&target)) => {
                graph.add_edge(source, target, edge.branch.clone());
            }
            _ => errors.push(ValidationError::DanglingEdge {
                from: edge.source.clone(),
                target: edge.target.clone(),
            }),
        }
    }

    let start_ids: Vec<&NodeId> = workflow
        .nodes
        .iter()
        .filter(|n| n.kind() == NodeKind::Start)
        .map(|n| &n.id)
        .collect();
    match start_ids.len() {
        0 => errors.push(ValidationError::MissingStart),
        1 => {}
        count => errors.push(ValidationError::MultipleStart { count }),
    }
    if !workflow.nodes.iter().any(|n| n.kind() == NodeKind::End) {
        errors.push(ValidationError::MissingEnd);
    }

    if toposort(&graph, None).is_err() {
        let mut nodes: Vec<String> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || scc.iter().any(|&n| graph.find_edge(n, n).is_some()))
            .flatten()
            .map(|n| graph[n].clone())
            .collect();
        nodes.sort();
        errors.push(ValidationError::Cycle { nodes });
    }

    if !errors.is_empty() {
        return Err(ValidationReport::new(errors));
    }

    let start_id = start_ids[0].clone();

    // Forward reachability from start.
    let mut reachable: HashSet<NodeIndex> = HashSet::new();
    let mut queue = VecDeque::from([index_of[&start_id]]);
    reachable.insert(index_of[&start_id]);
    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if reachable.insert(next) {
                queue.push_back(next);
            }
        }
    }

    // Reverse reachability from the end nodes.
    let mut reaches_end: HashSet<NodeIndex> = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = workflow
        .nodes
        .iter()
        .filter(|n| n.kind() == NodeKind::End)
        .map(|n| index_of[&n.id])
        .collect();
    reaches_end.extend(queue.iter().copied());
    while let Some(current) = queue.pop_front() {
        for prev in graph.neighbors_directed(current, Direction::Incoming) {
            if reaches_end.insert(prev) {
                queue.push_back(prev);
            }
        }
    }

    let mut warnings = Vec::new();
    let mut unreachable = HashSet::new();
    for node in &workflow.nodes {
        let idx = index_of[&node.id];
        if !reachable.contains(&idx) {
            warnings.push(format!("node '{}' is not reachable from start", node.id));
            unreachable.insert(node.id.clone());
        } else if node.kind() != NodeKind::End && !reaches_end.contains(&idx) {
            warnings.push(format!("node '{}' cannot reach any end node", node.id));
        }
    }

    let validated = ValidatedWorkflow {
        workflow,
        graph,
        index_of,
        start_id,
        unreachable,
        warnings,
    };

    // Template ancestry: a token may only name a variable some strict
    // ancestor produces. Checked once here, never re-checked per run.
    let mut render_errors = Vec::new();
    for node in validated.nodes() {
        let allowed: HashSet<String> =
            crate::vars::ancestor_paths(&validated, &node.id).into_iter().collect();
        for path in node.config.referenced_paths() {
            if !allowed.contains(&path) {
                render_errors.push(ValidationError::Render(RenderError::UnresolvedReference {
                    node: node.id.clone(),
                    path,
                }));
            }
        }
    }
    if !render_errors.is_empty() {
        return Err(ValidationReport::new(render_errors));
    }

    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        ConditionConfig, EndConfig, InputVariable, NodeConfig, ParallelConfig, StartConfig,
        ToolConfig, WorkflowNode,
    };

    fn start_node(id: &str, key: &str, inputs: &[&str]) -> WorkflowNode {
        WorkflowNode::new(
            id,
            key,
            NodeConfig::Start(StartConfig {
                input_variables: inputs
                    .iter()
                    .map(|name| InputVariable {
                        name: name.to_string(),
                        var_type: Default::default(),
                        description: None,
                    })
                    .collect(),
            }),
        )
    }

    fn end_node(id: &str, key: &str) -> WorkflowNode {
        WorkflowNode::new(id, key, NodeConfig::End(EndConfig::default()))
    }

    fn tool_node(id: &str, key: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            key,
            NodeConfig::Tool(ToolConfig {
                tool_id: "t".into(),
                tool_name: None,
                arguments: Default::default(),
            }),
        )
    }

    fn linear() -> Workflow {
        let mut wf = Workflow::new("linear");
        wf.add_node(start_node("s", "start", &["user_input"]));
        wf.add_node(tool_node("t", "fetch"));
        wf.add_node(end_node("e", "finish"));
        wf.connect("s", "t");
        wf.connect("t", "e");
        wf
    }

    fn errors_of(workflow: Workflow) -> Vec<ValidationError> {
        validate(workflow).err().expect("expected failure").errors
    }

    #[test]
    fn valid_workflow_passes() {
        let validated = validate(linear()).unwrap();
        assert!(validated.warnings().is_empty());
        assert_eq!(validated.start_id().as_str(), "s");
    }

    #[test]
    fn cycle_is_rejected_and_names_nodes() {
        let mut wf = linear();
        wf.connect("e", "t");
        let errors = errors_of(wf);
        match &errors[0] {
            ValidationError::Cycle { nodes } => {
                assert!(nodes.contains(&"t".to_string()));
                assert!(nodes.contains(&"e".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_reference_key_is_rejected() {
        let mut wf = linear();
        wf.add_node(tool_node("t2", "fetch"));
        wf.connect("s", "t2");
        wf.connect("t2", "e");
        assert!(errors_of(wf)
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateReferenceKey { key, .. } if key == "fetch")));
    }

    #[test]
    fn malformed_reference_key_is_rejected() {
        let mut wf = linear();
        wf.add_node(tool_node("t3", "bad key!"));
        wf.connect("s", "t3");
        wf.connect("t3", "e");
        assert!(errors_of(wf)
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidReferenceKey { .. })));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut wf = linear();
        wf.connect("t", "ghost");
        assert!(errors_of(wf)
            .iter()
            .any(|e| matches!(e, ValidationError::DanglingEdge { target, .. } if target == "ghost")));
    }

    #[test]
    fn start_and_end_cardinality() {
        let mut wf = Workflow::new("no start");
        wf.add_node(tool_node("t", "a"));
        let errors = errors_of(wf);
        assert!(errors.contains(&ValidationError::MissingStart));
        assert!(errors.contains(&ValidationError::MissingEnd));
    }

    #[test]
    fn unreachable_node_is_a_warning_not_an_error() {
        let mut wf = linear();
        wf.add_node(tool_node("island", "island"));
        wf.connect("island", "e");
        let validated = validate(wf).unwrap();
        assert!(validated.unreachable().contains("island"));
        assert_eq!(validated.warnings().len(), 1);
    }

    #[test]
    fn template_referencing_non_ancestor_fails_validation() {
        let mut wf = Workflow::new("bad ref");
        wf.add_node(start_node("s", "start", &[]));
        let mut cond = WorkflowNode::new(
            "c",
            "check",
            NodeConfig::Condition(ConditionConfig {
                condition_type: crate::graph::ConditionType::Expression,
                expression: Some("{{sibling.result}} == x".into()),
                ..Default::default()
            }),
        );
        cond.label = Some("check".into());
        wf.add_node(cond);
        wf.add_node(tool_node("sibling", "sibling"));
        wf.add_node(end_node("e", "finish"));
        wf.connect("s", "c");
        wf.connect("s", "sibling");
        wf.connect("c", "e");
        wf.connect("sibling", "e");
        let errors = errors_of(wf);
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::Render(RenderError::UnresolvedReference { node, path })
                if node == "c" && path == "sibling.result"
        )));
    }

    #[test]
    fn diamond_ancestors_are_collected_once() {
        let mut wf = Workflow::new("diamond");
        wf.add_node(start_node("s", "start", &[]));
        wf.add_node(WorkflowNode::new("p", "fan", NodeConfig::Parallel(ParallelConfig {})));
        wf.add_node(tool_node("a", "left"));
        wf.add_node(tool_node("b", "right"));
        wf.add_node(end_node("e", "finish"));
        wf.connect("s", "p");
        wf.connect("p", "a");
        wf.connect("p", "b");
        wf.connect("a", "e");
        wf.connect("b", "e");
        let validated = validate(wf).unwrap();
        let ancestors = validated.strict_ancestors("e");
        assert_eq!(ancestors.len(), 4);
        let unique: HashSet<_> = ancestors.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(!ancestors.contains(&"e".to_string()));
    }
}
