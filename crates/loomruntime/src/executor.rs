use crate::context::{NodeExecutionRecord, NodeStatus, RunState, RunStatus};
use crate::scheduler::Scheduler;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use loomcore::{
    EventBus, ExecutionEvent, ExecutorSet, NodeContext, NodeError, NodeId, NodeKind, NodeOutput,
    ValidatedWorkflow, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

type Completion = (NodeId, Result<NodeOutput, NodeError>, u64, u32);

/// Dispatches one run: pulls ready nodes from the scheduler, executes
/// them concurrently up to the worker-pool bound, and feeds completions
/// back until the run settles.
pub struct RunExecutor {
    executors: Arc<ExecutorSet>,
    max_parallel: usize,
    default_node_timeout: Duration,
    run_timeout: Option<Duration>,
}

impl RunExecutor {
    pub fn new(
        executors: Arc<ExecutorSet>,
        max_parallel: usize,
        default_node_timeout: Duration,
        run_timeout: Option<Duration>,
    ) -> Self {
        Self {
            executors,
            // A zero bound would let the dispatch loop spin without ever
            // spawning work.
            max_parallel: max_parallel.max(1),
            default_node_timeout,
            run_timeout,
        }
    }

    pub async fn execute(
        &self,
        workflow: Arc<ValidatedWorkflow>,
        inputs: HashMap<String, Value>,
        state: Arc<RwLock<RunState>>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> RunStatus {
        let started = Instant::now();
        let deadline = self.run_timeout.map(|t| tokio::time::Instant::now() + t);
        let run_id = {
            let mut guard = state.write().await;
            guard.status = RunStatus::Running;
            guard.started_at = Utc::now();

            // Seed the store with the run inputs under the start node's
            // reference key, so the start executor (and everything
            // downstream) can resolve them.
            if let Some(start) = workflow.node(workflow.start_id()) {
                for (name, value) in &inputs {
                    guard.store.insert(&start.reference_key, name, value.clone());
                }
            }
            guard.run_id
        };

        events.emit(ExecutionEvent::RunStarted {
            run_id,
            workflow_id: workflow.workflow().id,
            timestamp: Utc::now(),
        });
        tracing::info!(%run_id, workflow = %workflow.workflow().name, "run started");

        let mut scheduler = Scheduler::new(workflow.clone());

        // Unreachable nodes were marked skipped by the validator; give
        // them their trace records up front.
        let initial_skips = scheduler.initially_skipped();
        self.record_skips(&workflow, &state, &events, run_id, &initial_skips)
            .await;

        let mut running: FuturesUnordered<BoxFuture<'static, Completion>> =
            FuturesUnordered::new();
        let mut cancelled = false;
        let mut timed_out = false;

        loop {
            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                let skipped = scheduler.cancel_remaining();
                self.record_skips(&workflow, &state, &events, run_id, &skipped)
                    .await;
            }

            if !cancelled {
                for node_id in scheduler.ready_nodes() {
                    if running.len() >= self.max_parallel {
                        break;
                    }
                    scheduler.mark_running(&node_id);
                    self.spawn_node(
                        &workflow, &state, &events, run_id, &node_id, &cancel, &mut running,
                    )
                    .await;
                }
            }

            if running.is_empty() {
                if scheduler.is_settled() {
                    break;
                }
                // Ready nodes exist but the pool is saturated at zero:
                // only possible when cancelled mid-drain.
                if cancelled {
                    break;
                }
                continue;
            }

            let completion = match deadline {
                Some(deadline) if !timed_out => {
                    match tokio::time::timeout_at(deadline, running.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(%run_id, "run deadline exceeded, cancelling");
                            timed_out = true;
                            cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => running.next().await,
            };

            let Some((node_id, result, duration_ms, attempts)) = completion else {
                continue;
            };

            match result {
                Ok(output) => {
                    self.on_success(
                        &workflow,
                        &state,
                        &events,
                        &mut scheduler,
                        run_id,
                        &node_id,
                        output,
                        duration_ms,
                        attempts,
                    )
                    .await;
                }
                Err(error) => {
                    tracing::error!(%run_id, node = %node_id, %error, "node failed");
                    scheduler.record_failure(&node_id);
                    let mut guard = state.write().await;
                    guard.set_node_status(&node_id, NodeStatus::Failed);
                    guard.finish_record(
                        &node_id,
                        NodeStatus::Failed,
                        HashMap::new(),
                        None,
                        Some(&error),
                        attempts,
                    );
                    drop(guard);
                    events.emit(ExecutionEvent::NodeFailed {
                        run_id,
                        node_id: node_id.clone(),
                        error: error.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }

            let skipped = scheduler.reevaluate();
            self.record_skips(&workflow, &state, &events, run_id, &skipped)
                .await;
        }

        let final_status = if timed_out {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else if scheduler.any_end_succeeded() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        {
            let mut guard = state.write().await;
            guard.status = final_status;
            guard.finished_at = Some(Utc::now());
        }
        events.emit(ExecutionEvent::RunCompleted {
            run_id,
            success: final_status == RunStatus::Succeeded,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        tracing::info!(%run_id, status = ?final_status, "run finished");
        final_status
    }

    /// Spawn one node execution with its timeout, retry policy, and
    /// cooperative cancellation.
    async fn spawn_node(
        &self,
        workflow: &Arc<ValidatedWorkflow>,
        state: &Arc<RwLock<RunState>>,
        events: &Arc<EventBus>,
        run_id: loomcore::RunId,
        node_id: &str,
        cancel: &CancellationToken,
        running: &mut FuturesUnordered<BoxFuture<'static, Completion>>,
    ) {
        let Some(node) = workflow.node(node_id).cloned() else {
            return;
        };
        let kind = node.kind();
        let executor = self.executors.get(kind);
        let input_snapshot = serde_json::to_value(&node.config).unwrap_or_default();

        let ctx = {
            let mut guard = state.write().await;
            guard.set_node_status(node_id, NodeStatus::Running);
            guard.push_record(NodeExecutionRecord::started(
                node.id.clone(),
                kind,
                input_snapshot,
            ));
            NodeContext {
                node: node.clone(),
                vars: guard.store.clone(),
                events: events.emitter(run_id, node.id.clone()),
                cancellation: cancel.child_token(),
            }
        };

        events.emit(ExecutionEvent::NodeStarted {
            run_id,
            node_id: node.id.clone(),
            kind,
            timestamp: Utc::now(),
        });
        tracing::debug!(%run_id, node = %node.id, %kind, "dispatching node");

        let id = node.id.clone();
        let Some(executor) = executor else {
            running.push(Box::pin(async move {
                let error = NodeError::Config(format!("no executor for node kind '{kind}'"));
                (id, Err(error), 0, 0)
            }));
            return;
        };

        let retry = node.retry_policy();
        let timeout_secs = node.timeout_secs.unwrap_or(self.default_node_timeout.as_secs());
        let fallback_id = id.clone();

        let task = async move {
            let start = Instant::now();
            let mut attempts = 0u32;
            let result = loop {
                attempts += 1;
                let attempt = tokio::select! {
                    _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
                    result = timeout(
                        Duration::from_secs(timeout_secs),
                        executor.execute(ctx.clone()),
                    ) => match result {
                        Ok(inner) => inner,
                        Err(_) => Err(NodeError::Timeout { seconds: timeout_secs }),
                    },
                };
                match attempt {
                    Ok(output) => break Ok(output),
                    Err(error) if error.is_retryable() && attempts < retry.max_attempts => {
                        tracing::warn!(
                            node = %ctx.node.id,
                            %error,
                            attempt = attempts,
                            "retryable node failure, backing off"
                        );
                        sleep(retry.delay_for(attempts)).await;
                    }
                    Err(error) => break Err(error),
                }
            };
            (id, result, start.elapsed().as_millis() as u64, attempts)
        };

        let handle = tokio::spawn(task);
        running.push(Box::pin(async move {
            match handle.await {
                Ok(completion) => completion,
                Err(join_error) => (
                    fallback_id,
                    Err(NodeError::Transport(format!("task failed: {join_error}"))),
                    0,
                    0,
                ),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_success(
        &self,
        workflow: &Arc<ValidatedWorkflow>,
        state: &Arc<RwLock<RunState>>,
        events: &Arc<EventBus>,
        scheduler: &mut Scheduler,
        run_id: loomcore::RunId,
        node_id: &str,
        output: NodeOutput,
        duration_ms: u64,
        attempts: u32,
    ) {
        tracing::info!(%run_id, node = %node_id, duration_ms, "node completed");
        scheduler.record_success(node_id, output.branch.clone());

        let Some(node) = workflow.node(node_id) else {
            return;
        };
        let mut guard = state.write().await;
        guard
            .store
            .insert_outputs(&node.reference_key, output.outputs.clone());
        guard.set_node_status(node_id, NodeStatus::Succeeded);
        guard.finish_record(
            node_id,
            NodeStatus::Succeeded,
            output.outputs.clone(),
            output.branch.clone(),
            None,
            attempts,
        );
        if node.kind() == NodeKind::End {
            guard.output = output.outputs.get("result").cloned();
        }
        drop(guard);

        events.emit(ExecutionEvent::NodeCompleted {
            run_id,
            node_id: node_id.to_string(),
            outputs: output.outputs,
            branch: output.branch,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    async fn record_skips(
        &self,
        workflow: &Arc<ValidatedWorkflow>,
        state: &Arc<RwLock<RunState>>,
        events: &Arc<EventBus>,
        run_id: loomcore::RunId,
        skipped: &[NodeId],
    ) {
        if skipped.is_empty() {
            return;
        }
        let mut guard = state.write().await;
        for node_id in skipped {
            let kind = workflow
                .node(node_id)
                .map(|n| n.kind())
                .unwrap_or(NodeKind::Tool);
            guard.set_node_status(node_id, NodeStatus::Skipped);
            guard.push_record(NodeExecutionRecord::skipped(node_id.clone(), kind));
        }
        drop(guard);
        for node_id in skipped {
            tracing::debug!(%run_id, node = %node_id, "node skipped");
            events.emit(ExecutionEvent::NodeSkipped {
                run_id,
                node_id: node_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }
}
