use crate::context::NodeStatus;
use loomcore::{JoinPolicy, NodeId, NodeKind, ValidatedWorkflow};
use std::collections::HashMap;
use std::sync::Arc;

/// Topological scheduler for one run.
///
/// Tracks every node's status, re-evaluating readiness as nodes reach a
/// terminal state. An incoming edge carries a success only if its source
/// succeeded and, for branch-labelled edges, the source produced that
/// branch; a node whose predecessors are all terminal without a carried
/// success is skipped, and skips propagate transitively.
pub struct Scheduler {
    workflow: Arc<ValidatedWorkflow>,
    statuses: HashMap<NodeId, NodeStatus>,
    branches: HashMap<NodeId, String>,
}

impl Scheduler {
    pub fn new(workflow: Arc<ValidatedWorkflow>) -> Self {
        let mut statuses: HashMap<NodeId, NodeStatus> = workflow
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        for id in workflow.unreachable() {
            statuses.insert(id.clone(), NodeStatus::Skipped);
        }
        statuses.insert(workflow.start_id().clone(), NodeStatus::Ready);
        Self {
            workflow,
            statuses,
            branches: HashMap::new(),
        }
    }

    pub fn status(&self, node_id: &str) -> NodeStatus {
        self.statuses
            .get(node_id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    /// Ids the validator flagged unreachable, already marked skipped.
    pub fn initially_skipped(&self) -> Vec<NodeId> {
        self.workflow.unreachable().iter().cloned().collect()
    }

    /// Nodes currently ready, in definition order for deterministic
    /// dispatch.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.workflow
            .nodes()
            .iter()
            .filter(|n| self.status(&n.id) == NodeStatus::Ready)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn mark_running(&mut self, node_id: &str) {
        self.statuses
            .insert(node_id.to_string(), NodeStatus::Running);
    }

    pub fn record_success(&mut self, node_id: &str, branch: Option<String>) {
        self.statuses
            .insert(node_id.to_string(), NodeStatus::Succeeded);
        if let Some(branch) = branch {
            self.branches.insert(node_id.to_string(), branch);
        }
    }

    pub fn record_failure(&mut self, node_id: &str) {
        self.statuses.insert(node_id.to_string(), NodeStatus::Failed);
    }

    /// Re-evaluate pending nodes to a fixpoint. Newly ready nodes show up
    /// in [`ready_nodes`]; the returned list is the nodes newly skipped,
    /// so the caller can trace them.
    pub fn reevaluate(&mut self) -> Vec<NodeId> {
        let mut newly_skipped = Vec::new();
        loop {
            let mut changed = false;
            let pending: Vec<NodeId> = self
                .workflow
                .nodes()
                .iter()
                .filter(|n| self.status(&n.id) == NodeStatus::Pending)
                .map(|n| n.id.clone())
                .collect();
            for node_id in pending {
                if let Some(next) = self.evaluate(&node_id) {
                    self.statuses.insert(node_id.clone(), next);
                    if next == NodeStatus::Skipped {
                        newly_skipped.push(node_id);
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        newly_skipped
    }

    /// Decide a pending node's next status, or `None` while any direct
    /// predecessor is still non-terminal.
    fn evaluate(&self, node_id: &str) -> Option<NodeStatus> {
        let edges = self.workflow.incoming_edges(node_id);
        if edges.is_empty() {
            // Only the start node has no incoming edges and it never goes
            // through here; anything else was already skipped as
            // unreachable.
            return None;
        }
        let mut successes = 0usize;
        for edge in &edges {
            let source_status = self.status(&edge.source);
            if !source_status.is_terminal() {
                return None;
            }
            if source_status == NodeStatus::Succeeded && self.edge_active(edge) {
                successes += 1;
            }
        }
        let join = self
            .workflow
            .node(node_id)
            .map(|n| n.join)
            .unwrap_or_default();
        let ready = match join {
            JoinPolicy::Any => successes > 0,
            JoinPolicy::All => successes == edges.len(),
        };
        Some(if ready {
            NodeStatus::Ready
        } else {
            NodeStatus::Skipped
        })
    }

    /// An unlabelled edge activates whenever its source succeeds; a
    /// labelled edge only when the source produced that branch.
    fn edge_active(&self, edge: &loomcore::WorkflowEdge) -> bool {
        match &edge.branch {
            None => true,
            Some(label) => self.branches.get(&edge.source) == Some(label),
        }
    }

    /// True when nothing is ready or running: the run has settled.
    pub fn is_settled(&self) -> bool {
        !self
            .statuses
            .values()
            .any(|s| matches!(s, NodeStatus::Ready | NodeStatus::Running))
    }

    /// Cancellation: every pending/ready node becomes skipped. Running
    /// nodes are left to their cooperative cancellation.
    pub fn cancel_remaining(&mut self) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        for node in self.workflow.nodes() {
            let status = self.status(&node.id);
            if matches!(status, NodeStatus::Pending | NodeStatus::Ready) {
                self.statuses
                    .insert(node.id.clone(), NodeStatus::Skipped);
                skipped.push(node.id.clone());
            }
        }
        skipped
    }

    pub fn any_end_succeeded(&self) -> bool {
        self.workflow
            .nodes()
            .iter()
            .any(|n| n.kind() == NodeKind::End && self.status(&n.id) == NodeStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomcore::{
        validate, ConditionConfig, ConditionType, EndConfig, JoinPolicy, NodeConfig,
        ParallelConfig, StartConfig, ToolConfig, Workflow, WorkflowNode,
    };

    fn node(id: &str, config: NodeConfig) -> WorkflowNode {
        WorkflowNode::new(id, id, config)
    }

    fn start() -> WorkflowNode {
        node("start", NodeConfig::Start(StartConfig::default()))
    }

    fn tool(id: &str) -> WorkflowNode {
        node(
            id,
            NodeConfig::Tool(ToolConfig {
                tool_id: id.into(),
                tool_name: None,
                arguments: Default::default(),
            }),
        )
    }

    fn end(id: &str) -> WorkflowNode {
        node(id, NodeConfig::End(EndConfig::default()))
    }

    fn condition(id: &str) -> WorkflowNode {
        node(
            id,
            NodeConfig::Condition(ConditionConfig {
                condition_type: ConditionType::Expression,
                expression: Some("1 == 1".into()),
                ..Default::default()
            }),
        )
    }

    fn scheduler(workflow: Workflow) -> Scheduler {
        Scheduler::new(Arc::new(validate(workflow).unwrap()))
    }

    /// start -> condition -> {end_yes via "true", end_no via "false"}
    fn branching() -> Workflow {
        let mut wf = Workflow::new("branching");
        wf.add_node(start());
        wf.add_node(condition("check"));
        wf.add_node(end("end_yes"));
        wf.add_node(end("end_no"));
        wf.connect("start", "check");
        wf.connect_branch("check", "end_yes", "true");
        wf.connect_branch("check", "end_no", "false");
        wf
    }

    /// start -> parallel -> {t1, t2} -> join(end)
    fn fan_out(join: JoinPolicy) -> Workflow {
        let mut wf = Workflow::new("fan out");
        wf.add_node(start());
        wf.add_node(node("fan", NodeConfig::Parallel(ParallelConfig {})));
        wf.add_node(tool("t1"));
        wf.add_node(tool("t2"));
        wf.add_node(end("join").with_join(join));
        wf.connect("start", "fan");
        wf.connect("fan", "t1");
        wf.connect("fan", "t2");
        wf.connect("t1", "join");
        wf.connect("t2", "join");
        wf
    }

    #[test]
    fn start_is_initially_ready() {
        let sched = scheduler(branching());
        assert_eq!(sched.ready_nodes(), vec!["start".to_string()]);
    }

    #[test]
    fn branch_exclusivity() {
        let mut sched = scheduler(branching());
        sched.record_success("start", None);
        sched.reevaluate();
        assert_eq!(sched.status("check"), NodeStatus::Ready);

        sched.record_success("check", Some("true".into()));
        let skipped = sched.reevaluate();
        assert_eq!(sched.status("end_yes"), NodeStatus::Ready);
        assert_eq!(sched.status("end_no"), NodeStatus::Skipped);
        assert_eq!(skipped, vec!["end_no".to_string()]);
    }

    #[test]
    fn skip_propagates_to_exclusive_descendants() {
        let mut wf = branching();
        wf.add_node(tool("after_no"));
        // end nodes are terminal in the real graphs; hang the descendant
        // off the "false" branch target's chain instead.
        wf.edges.retain(|e| e.target != "end_no");
        wf.add_node(tool("no_path"));
        wf.connect_branch("check", "no_path", "false");
        wf.connect("no_path", "after_no");
        wf.connect("after_no", "end_no");
        let mut sched = scheduler(wf);
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_success("check", Some("true".into()));
        let skipped = sched.reevaluate();
        assert!(skipped.contains(&"no_path".to_string()));
        assert!(skipped.contains(&"after_no".to_string()));
        assert!(skipped.contains(&"end_no".to_string()));
    }

    #[test]
    fn join_waits_for_all_predecessors() {
        let mut sched = scheduler(fan_out(JoinPolicy::Any));
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_success("fan", None);
        sched.reevaluate();
        sched.record_success("t1", None);
        sched.reevaluate();
        // t2 not terminal yet: join must not fire
        assert_eq!(sched.status("join"), NodeStatus::Pending);
        sched.record_success("t2", None);
        sched.reevaluate();
        assert_eq!(sched.status("join"), NodeStatus::Ready);
    }

    #[test]
    fn any_join_readies_on_partial_failure() {
        let mut sched = scheduler(fan_out(JoinPolicy::Any));
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_success("fan", None);
        sched.reevaluate();
        sched.record_success("t1", None);
        sched.record_failure("t2");
        sched.reevaluate();
        assert_eq!(sched.status("join"), NodeStatus::Ready);
    }

    #[test]
    fn all_join_skips_on_partial_failure() {
        let mut sched = scheduler(fan_out(JoinPolicy::All));
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_success("fan", None);
        sched.reevaluate();
        sched.record_success("t1", None);
        sched.record_failure("t2");
        let skipped = sched.reevaluate();
        assert_eq!(skipped, vec!["join".to_string()]);
        assert!(sched.is_settled());
        assert!(!sched.any_end_succeeded());
    }

    #[test]
    fn join_skipped_when_all_predecessors_skipped() {
        let mut sched = scheduler(fan_out(JoinPolicy::Any));
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_failure("fan");
        let skipped = sched.reevaluate();
        assert_eq!(sched.status("t1"), NodeStatus::Skipped);
        assert_eq!(sched.status("t2"), NodeStatus::Skipped);
        assert_eq!(sched.status("join"), NodeStatus::Skipped);
        assert_eq!(skipped.len(), 3);
    }

    #[test]
    fn fan_out_readies_all_branches_concurrently() {
        let mut sched = scheduler(fan_out(JoinPolicy::Any));
        sched.record_success("start", None);
        sched.reevaluate();
        sched.record_success("fan", None);
        sched.reevaluate();
        let ready = sched.ready_nodes();
        assert!(ready.contains(&"t1".to_string()));
        assert!(ready.contains(&"t2".to_string()));
    }

    #[test]
    fn cancel_skips_pending_work() {
        let mut sched = scheduler(fan_out(JoinPolicy::Any));
        sched.record_success("start", None);
        sched.reevaluate();
        let skipped = sched.cancel_remaining();
        assert!(skipped.contains(&"fan".to_string()));
        assert!(sched.is_settled());
    }
}
