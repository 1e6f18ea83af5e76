use crate::{Context, Graph, Node, NodeOutcome, NodeStatus, evaluate_condition};
use serde::{Deserialize, Serialize};

/// Where a run goes after a node ends in an unrecovered `FAIL`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum FailureRoute {
    FailEdge { target: String },
    RetryTarget { target: String },
    FallbackRetryTarget { target: String },
    Terminate { node_id: String, reason: String },
}

impl FailureRoute {
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::FailEdge { target }
            | Self::RetryTarget { target }
            | Self::FallbackRetryTarget { target } => Some(target),
            Self::Terminate { .. } => None,
        }
    }

    /// Retry-target jumps loop back through the graph and count as reroutes.
    pub fn is_reroute(&self) -> bool {
        matches!(
            self,
            Self::RetryTarget { .. } | Self::FallbackRetryTarget { .. }
        )
    }
}

pub fn resolve_failure_route(
    graph: &Graph,
    node: &Node,
    outcome: &NodeOutcome,
    context: &Context,
) -> FailureRoute {
    let forced = NodeOutcome {
        status: NodeStatus::Fail,
        ..outcome.clone()
    };

    let fail_edge = graph
        .edges()
        .iter()
        .filter(|edge| edge.from == node.id && edge.is_conditional())
        .find(|edge| evaluate_condition(edge.condition_expr(), &forced, context));
    if let Some(edge) = fail_edge {
        return FailureRoute::FailEdge {
            target: edge.to.clone(),
        };
    }

    if let Some(target) = node.retry_target().filter(|id| graph.contains_node(id)) {
        return FailureRoute::RetryTarget {
            target: target.to_string(),
        };
    }

    if let Some(target) = node
        .fallback_retry_target()
        .filter(|id| graph.contains_node(id))
    {
        return FailureRoute::FallbackRetryTarget {
            target: target.to_string(),
        };
    }

    FailureRoute::Terminate {
        node_id: node.id.clone(),
        reason: outcome
            .failure_reason
            .clone()
            .unwrap_or_else(|| format!("stage '{}' failed with no failure route", node.id)),
    }
}
