use crate::{Context, EngineError, Graph, Node, NodeOutcome};
use async_trait::async_trait;
use std::sync::Arc;

pub mod passthrough;
pub mod registry;

/// Executes one node. Handlers may be invoked again for the same node on
/// retry and must never mutate the context directly; changes travel back
/// through `NodeOutcome::context_updates`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
    ) -> Result<NodeOutcome, EngineError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;
