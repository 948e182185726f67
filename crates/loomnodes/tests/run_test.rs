//! End-to-end runs through the runtime with stubbed capabilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loomcore::{
    ConditionConfig, ConditionType, EndConfig, EndOutputType, InputVariable, LlmConfig,
    NodeConfig, NodeError, ParallelConfig, RetryPolicy, StartConfig, ToolConfig, JoinPolicy,
    VarType, Value, Workflow, WorkflowNode,
};
use loomnodes::{AgentHost, Capabilities, ChatRequest, LlmClient};
use loomruntime::{NodeStatus, RunStatus, RuntimeConfig, WorkflowRuntime};

struct StaticLlm(&'static str);

#[async_trait]
impl LlmClient for StaticLlm {
    async fn chat(&self, _request: ChatRequest) -> Result<String, NodeError> {
        Ok(self.0.to_string())
    }
}

/// Tools succeed with "ran <id>" unless the id matches `fail_tool`,
/// which always fails with a 502.
struct StubHost {
    fail_tool: Option<&'static str>,
    delay: Option<Duration>,
    tool_calls: AtomicU32,
    fail_first: u32,
}

impl StubHost {
    fn ok() -> Self {
        Self {
            fail_tool: None,
            delay: None,
            tool_calls: AtomicU32::new(0),
            fail_first: 0,
        }
    }

    fn failing(tool_id: &'static str) -> Self {
        Self {
            fail_tool: Some(tool_id),
            ..Self::ok()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok()
        }
    }

    fn flaky(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Self::ok()
        }
    }
}

#[async_trait]
impl AgentHost for StubHost {
    async fn run_agent(&self, agent_id: &str, message: &str) -> Result<String, NodeError> {
        Ok(format!("{agent_id}: {message}"))
    }

    async fn run_tool(
        &self,
        tool_id: &str,
        _arguments: serde_json::Value,
    ) -> Result<String, NodeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let call = self.tool_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(NodeError::Transport("connection reset".to_string()));
        }
        if self.fail_tool == Some(tool_id) {
            return Err(NodeError::UpstreamServer { status: 502 });
        }
        Ok(format!("ran {tool_id}"))
    }
}

fn runtime_with(host: StubHost) -> WorkflowRuntime {
    let caps = Capabilities {
        llm: Arc::new(StaticLlm("stub reply")),
        host: Arc::new(host),
        http: reqwest::Client::new(),
    };
    WorkflowRuntime::new(loomnodes::standard_executors(caps), RuntimeConfig::default())
}

fn start_node(input: &str) -> WorkflowNode {
    WorkflowNode::new(
        "start",
        "start",
        NodeConfig::Start(StartConfig {
            input_variables: vec![InputVariable {
                name: input.to_string(),
                var_type: VarType::String,
                description: None,
            }],
        }),
    )
}

fn template_end(id: &str, template: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        id,
        NodeConfig::End(EndConfig {
            output_type: EndOutputType::Template,
            output_template: Some(template.to_string()),
            ..Default::default()
        }),
    )
}

fn tool_node(id: &str, tool_id: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        id,
        NodeConfig::Tool(ToolConfig {
            tool_id: tool_id.to_string(),
            tool_name: None,
            arguments: HashMap::new(),
        }),
    )
    .with_retry(RetryPolicy::none())
}

fn inputs(key: &str, value: &str) -> HashMap<String, Value> {
    HashMap::from([(key.to_string(), Value::from(value))])
}

fn branching_workflow() -> Workflow {
    let mut wf = Workflow::new("branching");
    wf.add_node(start_node("user_input"));
    wf.add_node(WorkflowNode::new(
        "check",
        "check",
        NodeConfig::Condition(ConditionConfig {
            condition_type: ConditionType::Expression,
            expression: Some("{{start.user_input}} == hi".to_string()),
            ..Default::default()
        }),
    ));
    wf.add_node(template_end("end_yes", "yes: {{start.user_input}}"));
    wf.add_node(template_end("end_no", "no"));
    wf.connect("start", "check");
    wf.connect_branch("check", "end_yes", "true");
    wf.connect_branch("check", "end_no", "false");
    wf
}

fn fan_out_workflow(join: JoinPolicy) -> Workflow {
    let mut wf = Workflow::new("fan_out");
    wf.add_node(start_node("user_input"));
    wf.add_node(WorkflowNode::new(
        "fan",
        "fan",
        NodeConfig::Parallel(ParallelConfig {}),
    ));
    wf.add_node(tool_node("t1", "alpha"));
    wf.add_node(tool_node("t2", "boom"));
    wf.add_node(template_end("end", "done").with_join(join));
    wf.connect("start", "fan");
    wf.connect("fan", "t1");
    wf.connect("fan", "t2");
    wf.connect("t1", "end");
    wf.connect("t2", "end");
    wf
}

#[tokio::test]
async fn condition_takes_true_branch_and_skips_the_other() {
    let runtime = runtime_with(StubHost::ok());
    let id = runtime.register(branching_workflow()).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "hi")).await.unwrap();

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["end_yes"], NodeStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["end_no"], NodeStatus::Skipped);
    assert_eq!(snapshot.output, Some(Value::String("yes: hi".to_string())));
}

#[tokio::test]
async fn condition_takes_false_branch() {
    let runtime = runtime_with(StubHost::ok());
    let id = runtime.register(branching_workflow()).await.unwrap();
    let run_id = runtime
        .submit(&id, inputs("user_input", "bye"))
        .await
        .unwrap();

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["end_yes"], NodeStatus::Skipped);
    assert_eq!(snapshot.output, Some(Value::String("no".to_string())));
}

#[tokio::test]
async fn condition_compares_numbers_numerically() {
    let runtime = runtime_with(StubHost::ok());
    let mut wf = Workflow::new("status_check");
    wf.add_node(start_node("status"));
    wf.add_node(WorkflowNode::new(
        "check",
        "check",
        NodeConfig::Condition(ConditionConfig {
            condition_type: ConditionType::Expression,
            expression: Some("{{start.status}} == 200".to_string()),
            ..Default::default()
        }),
    ));
    wf.add_node(template_end("end_ok", "ok"));
    wf.add_node(template_end("end_err", "error"));
    wf.connect("start", "check");
    wf.connect_branch("check", "end_ok", "true");
    wf.connect_branch("check", "end_err", "false");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("status", "200")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.output, Some(Value::String("ok".to_string())));
}

#[tokio::test]
async fn any_join_succeeds_when_one_parallel_branch_fails() {
    let runtime = runtime_with(StubHost::failing("boom"));
    let id = runtime
        .register(fan_out_workflow(JoinPolicy::Any))
        .await
        .unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["t1"], NodeStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["t2"], NodeStatus::Failed);
    assert_eq!(snapshot.node_statuses["end"], NodeStatus::Succeeded);
}

#[tokio::test]
async fn all_join_skips_when_one_parallel_branch_fails() {
    let runtime = runtime_with(StubHost::failing("boom"));
    let id = runtime
        .register(fan_out_workflow(JoinPolicy::All))
        .await
        .unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.node_statuses["end"], NodeStatus::Skipped);
}

#[tokio::test]
async fn transport_errors_are_retried_until_success() {
    let runtime = runtime_with(StubHost::flaky(2));
    let mut wf = Workflow::new("retry");
    wf.add_node(start_node("user_input"));
    wf.add_node(
        tool_node("t", "alpha").with_retry(RetryPolicy {
            max_attempts: 3,
            delay_ms: 1,
            backoff_multiplier: 1.0,
        }),
    );
    wf.add_node(template_end("end", "{{t.result}}"));
    wf.connect("start", "t");
    wf.connect("t", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.output, Some(Value::String("ran alpha".to_string())));
    let trace = runtime.trace(&run_id).await.unwrap();
    let record = trace.iter().find(|r| r.node_id == "t").unwrap();
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn upstream_server_error_exhausts_retries_and_fails_the_run() {
    let runtime = runtime_with(StubHost::failing("boom"));
    let mut wf = Workflow::new("exhausted");
    wf.add_node(start_node("user_input"));
    wf.add_node(
        tool_node("t", "boom").with_retry(RetryPolicy {
            max_attempts: 2,
            delay_ms: 1,
            backoff_multiplier: 1.0,
        }),
    );
    wf.add_node(template_end("end", "done"));
    wf.connect("start", "t");
    wf.connect("t", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    let trace = runtime.trace(&run_id).await.unwrap();
    let record = trace.iter().find(|r| r.node_id == "t").unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.status, NodeStatus::Failed);
    assert!(record.error.as_deref().unwrap_or_default().contains("502"));
    assert_eq!(record.error_kind.as_deref(), Some("upstream_server"));
}

#[tokio::test]
async fn node_timeout_fails_the_node_without_retrying() {
    let runtime = runtime_with(StubHost::slow(Duration::from_secs(30)));
    let mut wf = Workflow::new("node_timeout");
    wf.add_node(start_node("user_input"));
    wf.add_node(
        tool_node("slow", "alpha")
            .with_timeout(1)
            // Would retry transport errors; timeouts must not be retried.
            .with_retry(RetryPolicy {
                max_attempts: 3,
                delay_ms: 1,
                backoff_multiplier: 1.0,
            }),
    );
    wf.add_node(template_end("end", "done"));
    wf.connect("start", "slow");
    wf.connect("slow", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.node_statuses["slow"], NodeStatus::Failed);
    assert_eq!(snapshot.node_statuses["end"], NodeStatus::Skipped);
    let trace = runtime.trace(&run_id).await.unwrap();
    let record = trace.iter().find(|r| r.node_id == "slow").unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.error_kind.as_deref(), Some("timeout"));
    assert!(record
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out after 1s"));
}

#[tokio::test]
async fn run_deadline_fails_the_run_and_skips_pending_nodes() {
    let runtime = runtime_with(StubHost::slow(Duration::from_secs(30)));
    let mut wf = Workflow::new("run_deadline");
    wf.settings.max_run_time_ms = Some(200);
    wf.add_node(start_node("user_input"));
    wf.add_node(tool_node("slow", "alpha"));
    wf.add_node(template_end("end", "done"));
    wf.connect("start", "slow");
    wf.connect("slow", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_ne!(snapshot.node_statuses["slow"], NodeStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["end"], NodeStatus::Skipped);
}

#[tokio::test]
async fn zero_parallel_bound_still_makes_progress() {
    let runtime = runtime_with(StubHost::ok());
    let mut wf = branching_workflow();
    wf.settings.max_parallel_nodes = 0;

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "hi")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn llm_output_flows_into_end_variable() {
    let runtime = runtime_with(StubHost::ok());
    let mut wf = Workflow::new("llm_flow");
    wf.add_node(start_node("user_input"));
    wf.add_node(WorkflowNode::new(
        "answer",
        "answer",
        NodeConfig::Llm(LlmConfig {
            provider: None,
            model: None,
            system_prompt: None,
            user_prompt: "Q: {{start.user_input}}".to_string(),
            temperature: 0.0,
            max_tokens: 100,
        }),
    ));
    wf.add_node(WorkflowNode::new(
        "end",
        "end",
        NodeConfig::End(EndConfig {
            output_type: EndOutputType::Variable,
            output_variable: Some("answer.text".to_string()),
            ..Default::default()
        }),
    ));
    wf.connect("start", "answer");
    wf.connect("answer", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime
        .submit(&id, inputs("user_input", "why"))
        .await
        .unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(
        snapshot.output,
        Some(Value::String("stub reply".to_string()))
    );
}

#[tokio::test]
async fn cancel_stops_a_running_workflow() {
    let runtime = runtime_with(StubHost::slow(Duration::from_secs(30)));
    let mut wf = Workflow::new("cancel");
    wf.add_node(start_node("user_input"));
    wf.add_node(tool_node("slow", "alpha"));
    wf.add_node(template_end("end", "done"));
    wf.connect("start", "slow");
    wf.connect("slow", "end");

    let id = runtime.register(wf).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(runtime.cancel(&run_id).await);

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert_ne!(snapshot.node_statuses["end"], NodeStatus::Succeeded);
}

#[tokio::test]
async fn trace_has_exactly_one_record_per_node() {
    let runtime = runtime_with(StubHost::ok());
    let id = runtime.register(branching_workflow()).await.unwrap();
    let run_id = runtime.submit(&id, inputs("user_input", "hi")).await.unwrap();
    runtime.wait(&run_id).await.unwrap();

    let trace = runtime.trace(&run_id).await.unwrap();
    assert_eq!(trace.len(), 4);
    let skipped = trace.iter().find(|r| r.node_id == "end_no").unwrap();
    assert_eq!(skipped.status, NodeStatus::Skipped);
    let check = trace.iter().find(|r| r.node_id == "check").unwrap();
    assert_eq!(check.branch.as_deref(), Some("true"));
}

#[tokio::test]
async fn unreachable_nodes_are_skipped_without_running() {
    let runtime = runtime_with(StubHost::ok());
    let mut wf = Workflow::new("orphan");
    wf.add_node(start_node("user_input"));
    wf.add_node(template_end("end", "done"));
    wf.add_node(tool_node("orphan", "alpha"));
    wf.connect("start", "end");

    let id = runtime.register(wf).await.unwrap();
    let summary = runtime
        .list_workflows()
        .await
        .into_iter()
        .find(|s| s.id == id)
        .unwrap();
    assert!(!summary.warnings.is_empty());

    let run_id = runtime.submit(&id, inputs("user_input", "x")).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.node_statuses["orphan"], NodeStatus::Skipped);
}
