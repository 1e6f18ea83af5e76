use crate::{Context, EngineError, Graph, Node, NodeOutcome, handlers::NodeHandler};
use async_trait::async_trait;

/// Succeeds without side effects. Backs start nodes and conditional routing
/// points, whose only job is to let the edge selector run.
#[derive(Debug, Default)]
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn handle(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        Ok(NodeOutcome::success().with_notes(format!("{} node passed: {}", node.shape, node.id)))
    }
}
