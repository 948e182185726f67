//! Node executors for every workflow node kind, plus the clients they
//! use to reach LLM providers and the agent/tool host.

mod agent;
mod api;
mod capability;
mod classifier;
mod condition;
mod end;
mod llm;
mod parallel;
mod start;
mod tool;

use std::sync::Arc;

use loomcore::ExecutorSet;

pub use agent::AgentExecutor;
pub use api::ApiExecutor;
pub use capability::{
    AgentHost, AgentHostClient, Capabilities, ChatRequest, HttpLlmClient, LlmClient,
    classify_status, classify_transport,
};
pub use classifier::ClassifierExecutor;
pub use condition::ConditionExecutor;
pub use end::EndExecutor;
pub use llm::LlmExecutor;
pub use parallel::ParallelExecutor;
pub use start::StartExecutor;
pub use tool::ToolExecutor;

/// Builds the executor set covering every node kind, wired to the given
/// capabilities.
pub fn standard_executors(caps: Capabilities) -> ExecutorSet {
    let mut set = ExecutorSet::new();
    set.insert(Arc::new(StartExecutor));
    set.insert(Arc::new(EndExecutor));
    set.insert(Arc::new(LlmExecutor::new(caps.llm.clone())));
    set.insert(Arc::new(ApiExecutor::new(caps.http.clone())));
    set.insert(Arc::new(ConditionExecutor::new(caps.llm.clone())));
    set.insert(Arc::new(ClassifierExecutor::new(caps.llm)));
    set.insert(Arc::new(ParallelExecutor));
    set.insert(Arc::new(AgentExecutor::new(caps.host.clone())));
    set.insert(Arc::new(ToolExecutor::new(caps.host)));
    set
}
