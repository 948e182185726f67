use async_trait::async_trait;
use loomcore::{NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};

/// Fan-out marker. The node itself does no work; once it succeeds every
/// outgoing edge activates and the scheduler dispatches the successors
/// concurrently.
pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Parallel
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new())
    }
}
