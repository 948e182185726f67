use crate::context::{NodeExecutionRecord, RunSnapshot, RunState, RunStatus};
use crate::executor::RunExecutor;
use loomcore::{
    validate, EngineError, EventBus, ExecutionEvent, ExecutorSet, RunId, ValidatedWorkflow,
    ValidationReport, Value, Workflow, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Configuration for the workflow runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker-pool bound per run.
    pub max_parallel_nodes: usize,
    pub event_capacity: usize,
    pub default_node_timeout_secs: u64,
    /// Run-level deadline applied when the workflow settings carry none.
    pub run_timeout_secs: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_capacity: 1024,
            default_node_timeout_secs: 60,
            run_timeout_secs: None,
        }
    }
}

struct RunHandle {
    state: Arc<RwLock<RunState>>,
    cancel: CancellationToken,
}

/// Summary of a registered workflow, as listed by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    pub nodes: usize,
    pub edges: usize,
    pub warnings: Vec<String>,
}

/// Main entry point: registers validated workflows and runs them.
///
/// Submission is asynchronous: `submit` returns a run id immediately and
/// the run executes on a spawned task. Status and trace queries observe
/// the run live.
pub struct WorkflowRuntime {
    executors: Arc<ExecutorSet>,
    config: RuntimeConfig,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Arc<ValidatedWorkflow>>>>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
}

impl WorkflowRuntime {
    pub fn new(executors: ExecutorSet, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_capacity));
        Self {
            executors: Arc::new(executors),
            config,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate and register a workflow. Validation warnings stay
    /// attached to the stored workflow.
    pub async fn register(&self, workflow: Workflow) -> Result<WorkflowId, ValidationReport> {
        let id = workflow.id;
        let validated = Arc::new(validate(workflow)?);
        for warning in validated.warnings() {
            tracing::warn!(workflow = %id, "{warning}");
        }
        self.workflows.write().await.insert(id, validated);
        Ok(id)
    }

    pub async fn workflow(&self, id: &WorkflowId) -> Option<Arc<ValidatedWorkflow>> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn remove_workflow(&self, id: &WorkflowId) -> bool {
        self.workflows.write().await.remove(id).is_some()
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .read()
            .await
            .values()
            .map(|validated| {
                let wf = validated.workflow();
                WorkflowSummary {
                    id: wf.id,
                    name: wf.name.clone(),
                    description: wf.description.clone(),
                    nodes: wf.nodes.len(),
                    edges: wf.edges.len(),
                    warnings: validated.warnings().to_vec(),
                }
            })
            .collect()
    }

    /// Submit a run of a registered workflow. Returns the run id
    /// immediately; execution happens on a spawned task.
    pub async fn submit(
        &self,
        workflow_id: &WorkflowId,
        inputs: HashMap<String, Value>,
    ) -> loomcore::Result<RunId> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(self.submit_validated(workflow, inputs).await)
    }

    /// Submit a run of an already-validated workflow (the CLI path, which
    /// skips registration).
    pub async fn submit_validated(
        &self,
        workflow: Arc<ValidatedWorkflow>,
        inputs: HashMap<String, Value>,
    ) -> RunId {
        let run_id = Uuid::new_v4();
        let state = Arc::new(RwLock::new(RunState::new(
            run_id,
            workflow.workflow().id,
            workflow.nodes().iter().map(|n| n.id.clone()),
        )));
        let cancel = CancellationToken::new();
        self.runs.write().await.insert(
            run_id,
            RunHandle {
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );

        let settings = &workflow.workflow().settings;
        let run_timeout = settings
            .max_run_time_ms
            .map(Duration::from_millis)
            .or(self.config.run_timeout_secs.map(Duration::from_secs));
        let executor = RunExecutor::new(
            self.executors.clone(),
            settings.max_parallel_nodes.min(self.config.max_parallel_nodes),
            Duration::from_secs(self.config.default_node_timeout_secs),
            run_timeout,
        );
        let events = self.event_bus.clone();
        tokio::spawn(async move {
            executor
                .execute(workflow, inputs, state, events, cancel)
                .await;
        });
        run_id
    }

    pub async fn snapshot(&self, run_id: &RunId) -> Option<RunSnapshot> {
        let runs = self.runs.read().await;
        let handle = runs.get(run_id)?;
        let snapshot = handle.state.read().await.snapshot();
        Some(snapshot)
    }

    /// Ordered trace of every executed or skipped node in a run.
    pub async fn trace(&self, run_id: &RunId) -> Option<Vec<NodeExecutionRecord>> {
        let runs = self.runs.read().await;
        let handle = runs.get(run_id)?;
        let trace = handle.state.read().await.trace().to_vec();
        Some(trace)
    }

    /// Best-effort cancellation: pending and ready nodes become skipped,
    /// running nodes are asked to stop cooperatively.
    pub async fn cancel(&self, run_id: &RunId) -> bool {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Block until a run reaches a terminal status.
    pub async fn wait(&self, run_id: &RunId) -> loomcore::Result<RunSnapshot> {
        let mut events = self.subscribe();
        loop {
            let snapshot = self
                .snapshot(run_id)
                .await
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            match events.recv().await {
                Ok(ExecutionEvent::RunCompleted { run_id: done, .. }) if done == *run_id => {
                    continue; // next snapshot read observes the terminal state
                }
                Ok(_) => continue,
                // Lagged or closed: fall back to polling the snapshot.
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn executor_kinds(&self) -> Vec<loomcore::NodeKind> {
        self.executors.kinds()
    }
}
