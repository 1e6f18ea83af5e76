use crate::parallel::{ParallelSettings, find_fan_in};
use crate::{
    Diagnostic, EngineConfig, Graph, HandlerRegistry, JoinPolicy, ValidationError,
    validate_condition_expression,
};
use std::collections::{BTreeSet, VecDeque};

/// Extra graph checks supplied by the embedding application.
pub trait ValidationRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(
    graph: &Graph,
    handlers: &HandlerRegistry,
    config: &EngineConfig,
) -> Vec<Diagnostic> {
    validate_with_rules(graph, handlers, config, &[])
}

pub fn validate_with_rules(
    graph: &Graph,
    handlers: &HandlerRegistry,
    config: &EngineConfig,
    extra_rules: &[&dyn ValidationRule],
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_terminal_node(graph));
    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_condition_syntax(graph));
    diagnostics.extend(rule_shape_known(graph, handlers));
    diagnostics.extend(rule_retry_target_exists(graph));
    diagnostics.extend(rule_goal_gate_has_retry(graph));
    diagnostics.extend(rule_retry_attributes(graph, config));
    diagnostics.extend(rule_parallel_policy(graph, config));
    diagnostics.extend(rule_fan_out_has_fan_in(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

/// Errors fail the load; warnings come back with the `Ok`.
pub fn validate_or_raise(
    graph: &Graph,
    handlers: &HandlerRegistry,
    config: &EngineConfig,
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, handlers, config);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    for diagnostic in diagnostics.iter() {
        tracing::debug!(graph_id = %graph.id(), %diagnostic, "validation warning");
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::error(
            "start_node",
            format!(
                "pipeline must have exactly one start node; found {}",
                starts.len()
            ),
        )]
    }
}

fn rule_terminal_node(graph: &Graph) -> Vec<Diagnostic> {
    if graph.terminal_candidates().is_empty() {
        vec![Diagnostic::error(
            "terminal_node",
            "pipeline must have at least one terminal node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in graph.edges() {
        for (end, id) in [("source", &edge.from), ("target", &edge.to)] {
            if !graph.contains_node(id) {
                diagnostics.push(
                    Diagnostic::error(
                        "edge_endpoints_exist",
                        format!("edge {end} '{id}' does not exist"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .start_candidates()
        .into_iter()
        .filter(|start| graph.edges().iter().any(|edge| edge.to == start.id))
        .map(|start| {
            Diagnostic::error("start_no_incoming", "start node must have no incoming edges")
                .with_node_id(start.id.clone())
        })
        .collect()
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .terminal_candidates()
        .into_iter()
        .filter(|exit| graph.edges().iter().any(|edge| edge.from == exit.id))
        .map(|exit| {
            Diagnostic::error("exit_no_outgoing", "terminal node must have no outgoing edges")
                .with_node_id(exit.id.clone())
        })
        .collect()
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_node() else {
        return Vec::new();
    };

    let mut visited = BTreeSet::from([start.id.as_str()]);
    let mut queue = VecDeque::from([start.id.as_str()]);
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.edges().iter().filter(|edge| edge.from == node_id) {
            if visited.insert(edge.to.as_str()) {
                queue.push_back(edge.to.as_str());
            }
        }
    }

    graph
        .nodes()
        .filter(|node| !visited.contains(node.id.as_str()))
        .map(|node| {
            Diagnostic::warning("reachability", "node is unreachable from start")
                .with_node_id(node.id.clone())
        })
        .collect()
}

fn rule_condition_syntax(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .edges()
        .iter()
        .filter(|edge| edge.is_conditional())
        .filter_map(|edge| {
            validate_condition_expression(edge.condition_expr())
                .err()
                .map(|message| {
                    Diagnostic::error("condition_syntax", message)
                        .with_edge(edge.from.clone(), edge.to.clone())
                })
        })
        .collect()
}

fn rule_shape_known(graph: &Graph, handlers: &HandlerRegistry) -> Vec<Diagnostic> {
    graph
        .nodes()
        .filter(|node| !handlers.supports_shape(&node.shape))
        .map(|node| {
            Diagnostic::error(
                "shape_known",
                format!("no handler registered for shape '{}'", node.shape),
            )
            .with_node_id(node.id.clone())
            .with_fix("register a handler for this shape before running the graph")
        })
        .collect()
}

fn rule_retry_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for (key, target) in [
        ("retry_target", graph.retry_target()),
        ("fallback_retry_target", graph.fallback_retry_target()),
    ] {
        if let Some(target) = target.filter(|id| !graph.contains_node(id)) {
            diagnostics.push(Diagnostic::error(
                "retry_target_exists",
                format!("graph {key} references missing node '{target}'"),
            ));
        }
    }

    for node in graph.nodes() {
        for (key, target) in [
            ("retry_target", node.retry_target()),
            ("fallback_retry_target", node.fallback_retry_target()),
        ] {
            if let Some(target) = target.filter(|id| !graph.contains_node(id)) {
                diagnostics.push(
                    Diagnostic::error(
                        "retry_target_exists",
                        format!("node {key} references missing node '{target}'"),
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
    }

    diagnostics
}

fn rule_goal_gate_has_retry(graph: &Graph) -> Vec<Diagnostic> {
    let graph_has_target =
        graph.retry_target().is_some() || graph.fallback_retry_target().is_some();
    if graph_has_target {
        return Vec::new();
    }
    graph
        .nodes()
        .filter(|node| node.is_goal_gate())
        .filter(|node| node.retry_target().is_none() && node.fallback_retry_target().is_none())
        .map(|node| {
            Diagnostic::warning(
                "goal_gate_has_retry",
                "goal_gate node should define retry_target or fallback_retry_target",
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}

fn rule_retry_attributes(graph: &Graph, config: &EngineConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if let Some(name) = graph.attrs().get_str("default_backoff_policy") {
        if config.backoff_config(name).is_none() {
            diagnostics.push(Diagnostic::error(
                "backoff_policy_known",
                format!("graph default_backoff_policy '{name}' is not a known preset"),
            ));
        }
    }
    if graph
        .attrs()
        .get("default_max_retry")
        .is_some_and(|value| value.as_i64().is_none_or(|value| value < 0))
    {
        diagnostics.push(Diagnostic::error(
            "retry_attributes",
            "graph default_max_retry must be a non-negative integer",
        ));
    }

    for node in graph.nodes() {
        if let Some(name) = node.attrs.get_str("backoff_policy") {
            if config.backoff_config(name).is_none() {
                diagnostics.push(
                    Diagnostic::error(
                        "backoff_policy_known",
                        format!("backoff_policy '{name}' is not a known preset"),
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
        if node
            .attrs
            .get("max_retries")
            .is_some_and(|value| value.as_i64().is_none_or(|value| value < 0))
        {
            diagnostics.push(
                Diagnostic::error("retry_attributes", "max_retries must be a non-negative integer")
                    .with_node_id(node.id.clone()),
            );
        }
    }

    diagnostics
}

fn rule_parallel_policy(graph: &Graph, config: &EngineConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes().filter(|node| node.is_fan_out()) {
        let branch_count = graph.edges().iter().filter(|edge| edge.from == node.id).count();
        if branch_count == 0 {
            diagnostics.push(
                Diagnostic::error("parallel_policy", "fan-out node has no branches")
                    .with_node_id(node.id.clone()),
            );
        }

        match ParallelSettings::from_node(node, config) {
            Err(message) => diagnostics.push(
                Diagnostic::error("parallel_policy", message).with_node_id(node.id.clone()),
            ),
            Ok(settings) => {
                if let JoinPolicy::KOfN { k } = settings.join_policy {
                    if k > branch_count {
                        diagnostics.push(
                            Diagnostic::warning(
                                "parallel_policy",
                                format!(
                                    "k_of_n needs {k} successes but the fan-out has {branch_count} branches"
                                ),
                            )
                            .with_node_id(node.id.clone()),
                        );
                    }
                }
            }
        }
    }
    diagnostics
}

fn rule_fan_out_has_fan_in(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes()
        .filter(|node| node.is_fan_out())
        .filter_map(|node| {
            find_fan_in(graph, &node.id).err().map(|error| {
                Diagnostic::error("fan_out_has_fan_in", error.to_string())
                    .with_node_id(node.id.clone())
            })
        })
        .collect()
}
