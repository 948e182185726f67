//! Clients for the external services node executors call into.
//!
//! LLM access goes through an OpenAI-compatible chat completion endpoint,
//! and agent/tool invocations go through the host platform's HTTP API.
//! Both are behind traits so tests can substitute stubs.

use std::sync::Arc;

use async_trait::async_trait;
use loomcore::NodeError;
use serde_json::json;

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Chat completion capability used by the llm, condition and classifier executors.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the assistant's reply text.
    async fn chat(&self, request: ChatRequest) -> Result<String, NodeError>;
}

/// Host platform capability used by the agent and tool executors.
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// Sends a message to a hosted agent and returns its reply.
    async fn run_agent(&self, agent_id: &str, message: &str) -> Result<String, NodeError>;

    /// Invokes a hosted tool with the given arguments and returns its result.
    async fn run_tool(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<String, NodeError>;
}

/// Everything the standard executor set needs to talk to the outside world.
#[derive(Clone)]
pub struct Capabilities {
    pub llm: Arc<dyn LlmClient>,
    pub host: Arc<dyn AgentHost>,
    pub http: reqwest::Client,
}

/// Maps a reqwest error onto the node error taxonomy.
pub fn classify_transport(error: reqwest::Error) -> NodeError {
    match error.status() {
        Some(status) if status.is_client_error() => NodeError::UpstreamClient {
            status: status.as_u16(),
        },
        Some(status) if status.is_server_error() => NodeError::UpstreamServer {
            status: status.as_u16(),
        },
        _ => NodeError::Transport(error.to_string()),
    }
}

/// Maps a non-success HTTP status onto the node error taxonomy.
pub fn classify_status(status: u16) -> Option<NodeError> {
    match status {
        400..=499 => Some(NodeError::UpstreamClient { status }),
        500..=599 => Some(NodeError::UpstreamServer { status }),
        _ => None,
    }
}

/// OpenAI-compatible chat completion client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<String, NodeError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user_prompt }));

        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(classify_transport)?;
        let status = response.status().as_u16();
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NodeError::Transport("malformed chat completion response".to_string()))
    }
}

/// HTTP client for the platform that hosts agents and tools.
pub struct AgentHostClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AgentHostClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn post_json(
        &self,
        path: String,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, NodeError> {
        let mut http = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(classify_transport)?;
        let status = response.status().as_u16();
        if let Some(error) = classify_status(status) {
            return Err(error);
        }
        response
            .json()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))
    }
}

#[async_trait]
impl AgentHost for AgentHostClient {
    async fn run_agent(&self, agent_id: &str, message: &str) -> Result<String, NodeError> {
        let payload = self
            .post_json(
                format!("/api/agents/{agent_id}/chat"),
                json!({ "message": message }),
            )
            .await?;
        payload["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NodeError::Transport("malformed agent response".to_string()))
    }

    async fn run_tool(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<String, NodeError> {
        let payload = self
            .post_json(
                format!("/api/tools/{tool_id}/execute"),
                json!({ "arguments": arguments }),
            )
            .await?;
        match &payload["result"] {
            serde_json::Value::String(text) => Ok(text.clone()),
            other => serde_json::to_string(other)
                .map_err(|e| NodeError::Transport(e.to_string())),
        }
    }
}
