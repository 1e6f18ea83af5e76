use crate::{Graph, NodeOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerouteSource {
    NodeRetryTarget,
    NodeFallbackRetryTarget,
    GraphRetryTarget,
    GraphFallbackRetryTarget,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GoalGateCheck {
    Satisfied,
    Reroute {
        unsatisfied: Vec<String>,
        target: String,
        source: RerouteSource,
    },
    Unsatisfied {
        unsatisfied: Vec<String>,
    },
}

/// Visited `goal_gate` nodes whose last outcome is not success-like, in
/// first-visit order.
pub fn unsatisfied_goal_gates(
    graph: &Graph,
    visited: &[String],
    node_outcomes: &BTreeMap<String, NodeOutcome>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    visited
        .iter()
        .filter(|node_id| seen.insert(node_id.as_str()))
        .filter(|node_id| {
            graph
                .node(node_id)
                .map(|node| node.is_goal_gate())
                .unwrap_or(false)
        })
        .filter(|node_id| {
            !node_outcomes
                .get(node_id.as_str())
                .map(|outcome| outcome.status.is_success_like())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Node targets first, then graph-level ones. Targets naming unknown nodes
/// are skipped.
pub fn resolve_reroute_target(graph: &Graph, gate_id: &str) -> Option<(String, RerouteSource)> {
    let node = graph.node(gate_id).ok()?;
    [
        (node.retry_target(), RerouteSource::NodeRetryTarget),
        (
            node.fallback_retry_target(),
            RerouteSource::NodeFallbackRetryTarget,
        ),
        (graph.retry_target(), RerouteSource::GraphRetryTarget),
        (
            graph.fallback_retry_target(),
            RerouteSource::GraphFallbackRetryTarget,
        ),
    ]
    .into_iter()
    .find_map(|(target, source)| {
        target
            .filter(|id| graph.contains_node(id))
            .map(|id| (id.to_string(), source))
    })
}

pub fn check_goal_gates(
    graph: &Graph,
    visited: &[String],
    node_outcomes: &BTreeMap<String, NodeOutcome>,
) -> GoalGateCheck {
    let unsatisfied = unsatisfied_goal_gates(graph, visited, node_outcomes);
    let Some(first) = unsatisfied.first() else {
        return GoalGateCheck::Satisfied;
    };

    match resolve_reroute_target(graph, first) {
        Some((target, source)) => GoalGateCheck::Reroute {
            unsatisfied,
            target,
            source,
        },
        None => GoalGateCheck::Unsatisfied { unsatisfied },
    }
}
