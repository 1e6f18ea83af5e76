use crate::{EngineError, Graph};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchPlan {
    pub branch_id: String,
    pub entry_node: String,
    /// Nodes the branch may execute; excludes the fan-in and terminal nodes.
    pub nodes: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanOutPlan {
    pub fan_out_node: String,
    pub fan_in_node: String,
    pub branches: Vec<BranchPlan>,
}

/// Nearest fan-in that closes `fan_out_id`. Nested fan-out/fan-in pairs
/// on the way are skipped by tracking the nesting depth.
pub fn find_fan_in(graph: &Graph, fan_out_id: &str) -> Result<String, EngineError> {
    let max_depth = graph.nodes().count();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::new();
    for edge in graph.outgoing_edges(fan_out_id)? {
        queue.push_back((edge.to.as_str(), 0usize));
    }

    while let Some((node_id, depth)) = queue.pop_front() {
        if !seen.insert((node_id, depth)) {
            continue;
        }
        let Ok(node) = graph.node(node_id) else {
            continue;
        };
        let next_depth = if node.is_fan_in() {
            if depth == 0 {
                return Ok(node_id.to_string());
            }
            depth - 1
        } else if node.is_fan_out() {
            depth + 1
        } else {
            depth
        };
        if next_depth > max_depth || graph.is_terminal(node) {
            continue;
        }
        for edge in graph.outgoing_edges(node_id)? {
            queue.push_back((edge.to.as_str(), next_depth));
        }
    }

    Err(EngineError::InvalidGraph(format!(
        "fan-out '{fan_out_id}' has no reachable fan-in"
    )))
}

pub fn plan_fan_out(graph: &Graph, fan_out_id: &str) -> Result<FanOutPlan, EngineError> {
    let fan_in = find_fan_in(graph, fan_out_id)?;
    let edges = graph.outgoing_edges(fan_out_id)?;

    let mut label_counts = BTreeMap::new();
    for edge in &edges {
        let label = edge.label_text();
        if !label.is_empty() {
            *label_counts.entry(label).or_insert(0usize) += 1;
        }
    }

    let mut used_ids = BTreeSet::new();
    let mut branches = Vec::with_capacity(edges.len());
    for (index, edge) in edges.iter().enumerate() {
        let label = edge.label_text();
        let mut branch_id = if label_counts.get(label) == Some(&1) {
            label.to_string()
        } else {
            edge.to.clone()
        };
        if !used_ids.insert(branch_id.clone()) {
            branch_id = format!("{branch_id}-{index}");
            used_ids.insert(branch_id.clone());
        }

        branches.push(BranchPlan {
            branch_id,
            entry_node: edge.to.clone(),
            nodes: branch_nodes(graph, &edge.to, &fan_in)?,
        });
    }

    Ok(FanOutPlan {
        fan_out_node: fan_out_id.to_string(),
        fan_in_node: fan_in,
        branches,
    })
}

fn branch_nodes(graph: &Graph, entry: &str, fan_in: &str) -> Result<BTreeSet<String>, EngineError> {
    let mut nodes = BTreeSet::new();
    let mut queue = VecDeque::from([entry.to_string()]);
    while let Some(node_id) = queue.pop_front() {
        if node_id == fan_in || nodes.contains(&node_id) {
            continue;
        }
        let node = graph.node(&node_id)?;
        if graph.is_terminal(node) {
            continue;
        }
        for edge in graph.outgoing_edges(&node_id)? {
            queue.push_back(edge.to.clone());
        }
        nodes.insert(node_id);
    }
    Ok(nodes)
}
