use crate::Diagnostic;
use conduit_turnstore::TurnStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Storage(#[from] TurnStoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl EngineError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "node",
            id: id.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.diagnostics
            .iter()
            .any(|diagnostic| diagnostic.is_error() && diagnostic.rule == rule)
    }
}
