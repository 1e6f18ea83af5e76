use crate::handlers::{SharedNodeHandler, passthrough::PassthroughHandler};
use crate::{EngineError, Node, SHAPE_CONDITIONAL, SHAPE_START, STRUCTURAL_SHAPES};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shape-keyed handler table. Built once before the runner is created and
/// read-only afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers_by_shape: BTreeMap<String, SharedNodeHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass-through handlers for start and conditional nodes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SHAPE_START, Arc::new(PassthroughHandler));
        registry.register(SHAPE_CONDITIONAL, Arc::new(PassthroughHandler));
        registry
    }

    pub fn register(
        &mut self,
        shape: impl Into<String>,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.handlers_by_shape.insert(shape.into(), handler)
    }

    pub fn with_handler(mut self, shape: impl Into<String>, handler: SharedNodeHandler) -> Self {
        self.register(shape, handler);
        self
    }

    pub fn shapes(&self) -> impl Iterator<Item = &str> {
        self.handlers_by_shape.keys().map(String::as_str)
    }

    /// True for registered shapes and for shapes the runner drives itself.
    pub fn supports_shape(&self, shape: &str) -> bool {
        self.handlers_by_shape.contains_key(shape) || STRUCTURAL_SHAPES.contains(&shape)
    }

    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        self.handlers_by_shape.get(&node.shape).cloned()
    }

    pub fn resolve_or_err(&self, node: &Node) -> Result<SharedNodeHandler, EngineError> {
        self.resolve(node).ok_or_else(|| {
            EngineError::Handler(format!(
                "no handler registered for shape '{}' (node '{}')",
                node.shape, node.id
            ))
        })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("shapes", &self.handlers_by_shape.keys().collect::<Vec<_>>())
            .finish()
    }
}
