use chrono::{DateTime, Utc};
use loomcore::{NodeError, NodeId, NodeKind, RunId, Value, VariableStore, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One node's execution, as recorded in the run trace. Created when the
/// node starts running (or is skipped), finalized in place exactly once,
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Snapshot of the node's configuration at dispatch time.
    pub input: serde_json::Value,
    pub output: HashMap<String, Value>,
    pub branch: Option<String>,
    pub error: Option<String>,
    /// Stable classification of the error (`timeout`, `upstream_client`,
    /// `upstream_server`, `transport`, `config`, `cancelled`).
    pub error_kind: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    pub fn started(node_id: NodeId, kind: NodeKind, input: serde_json::Value) -> Self {
        Self {
            node_id,
            kind,
            status: NodeStatus::Running,
            input,
            output: HashMap::new(),
            branch: None,
            error: None,
            error_kind: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn skipped(node_id: NodeId, kind: NodeKind) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            kind,
            status: NodeStatus::Skipped,
            input: serde_json::Value::Null,
            output: HashMap::new(),
            branch: None,
            error: None,
            error_kind: None,
            attempts: 0,
            started_at: now,
            finished_at: Some(now),
        }
    }
}

/// Mutable per-run state: node statuses, the variable store, the trace,
/// and the final output. Owned exclusively by its run; the dispatch loop
/// is the single writer.
#[derive(Debug)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub node_statuses: HashMap<NodeId, NodeStatus>,
    pub store: VariableStore,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    trace: Vec<NodeExecutionRecord>,
    trace_index: HashMap<NodeId, usize>,
}

impl RunState {
    pub fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        node_ids: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            status: RunStatus::Pending,
            node_statuses: node_ids
                .into_iter()
                .map(|id| (id, NodeStatus::Pending))
                .collect(),
            store: VariableStore::new(),
            output: None,
            started_at: Utc::now(),
            finished_at: None,
            trace: Vec::new(),
            trace_index: HashMap::new(),
        }
    }

    pub fn set_node_status(&mut self, node_id: &str, status: NodeStatus) {
        if let Some(slot) = self.node_statuses.get_mut(node_id) {
            *slot = status;
        }
    }

    /// Append a record for a node entering `running` (or being skipped).
    /// At most one record per node per run.
    pub fn push_record(&mut self, record: NodeExecutionRecord) {
        debug_assert!(!self.trace_index.contains_key(&record.node_id));
        self.trace_index
            .insert(record.node_id.clone(), self.trace.len());
        self.trace.push(record);
    }

    /// Finalize a node's record in place. No-op if the record is already
    /// terminal: records are immutable once written.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_record(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        output: HashMap<String, Value>,
        branch: Option<String>,
        error: Option<&NodeError>,
        attempts: u32,
    ) {
        let Some(&idx) = self.trace_index.get(node_id) else {
            return;
        };
        let record = &mut self.trace[idx];
        if record.status.is_terminal() {
            return;
        }
        record.status = status;
        record.output = output;
        record.branch = branch;
        record.error = error.map(|e| e.to_string());
        record.error_kind = error.map(|e| e.kind().to_string());
        record.attempts = attempts;
        record.finished_at = Some(Utc::now());
    }

    pub fn trace(&self) -> &[NodeExecutionRecord] {
        &self.trace
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            status: self.status,
            node_statuses: self.node_statuses.clone(),
            output: self.output.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only view of a run, as exposed by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub node_statuses: HashMap<NodeId, NodeStatus>,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
