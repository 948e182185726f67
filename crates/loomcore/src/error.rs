use thiserror::Error;

/// Fatal graph-authoring errors. These never surface mid-run: a workflow
/// that fails validation is never dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow contains a cycle through nodes: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("duplicate reference key '{key}' on nodes '{first}' and '{second}'")]
    DuplicateReferenceKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("invalid reference key '{key}' on node '{node}'")]
    InvalidReferenceKey { key: String, node: String },

    #[error("edge references missing node: {from} -> {target}")]
    DanglingEdge { from: String, target: String },

    #[error("workflow must have exactly one start node")]
    MissingStart,

    #[error("workflow has {count} start nodes, expected exactly one")]
    MultipleStart { count: usize },

    #[error("workflow must have at least one end node")]
    MissingEnd,

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Template errors caught at validation time. At run time an unresolved
/// token renders as an empty string instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("node '{node}' references '{path}', which no strict ancestor produces")]
    UnresolvedReference { node: String, path: String },
}

/// All validation errors for a workflow, collected rather than
/// first-error-wins so the editor can show everything at once.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workflow validation failed ({} errors):", self.errors.len())?;
        for error in &self.errors {
            write!(f, " {};", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

/// Errors scoped to one node execution. Recorded in the node's trace
/// record; never crashes the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("upstream returned client error status {status}")]
    UpstreamClient { status: u16 },

    #[error("upstream returned server error status {status}")]
    UpstreamServer { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// Transient failures worth another attempt. Timeouts are excluded:
    /// the timed-out call may already have had side effects.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Transport(_) | NodeError::UpstreamServer { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Timeout { .. } => "timeout",
            NodeError::UpstreamClient { .. } => "upstream_client",
            NodeError::UpstreamServer { .. } => "upstream_server",
            NodeError::Transport(_) => "transport",
            NodeError::Config(_) => "config",
            NodeError::Cancelled => "cancelled",
        }
    }
}

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationReport),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
