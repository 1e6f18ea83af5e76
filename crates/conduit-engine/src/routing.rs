use crate::{Context, EngineError, Graph, NodeOutcome, evaluate_condition, graph::Edge};
use serde::{Deserialize, Serialize};

/// Which priority step picked the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    ConditionMatch,
    PreferredLabel,
    SuggestedNextId,
    Weight,
    LexicalTiebreak,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConditionMatch => "condition_match",
            Self::PreferredLabel => "preferred_label",
            Self::SuggestedNextId => "suggested_next_id",
            Self::Weight => "weight",
            Self::LexicalTiebreak => "lexical_tiebreak",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeSelection<'a> {
    pub edge: &'a Edge,
    pub reason: SelectionReason,
}

pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &str,
    outcome: &NodeOutcome,
    context: &Context,
) -> Result<Option<EdgeSelection<'a>>, EngineError> {
    let edges = graph.outgoing_edges(from_node_id)?;
    Ok(select_edge(&edges, outcome, context))
}

/// Picks one edge out of `edges` (a node's outgoing edges in definition
/// order). Conditioned edges only take part in step 1.
pub fn select_edge<'a>(
    edges: &[&'a Edge],
    outcome: &NodeOutcome,
    context: &Context,
) -> Option<EdgeSelection<'a>> {
    // Step 1: condition match
    if let Some(edge) = edges.iter().copied().find(|edge| {
        edge.is_conditional() && evaluate_condition(edge.condition_expr(), outcome, context)
    }) {
        return Some(EdgeSelection {
            edge,
            reason: SelectionReason::ConditionMatch,
        });
    }

    let unconditional: Vec<&'a Edge> = edges
        .iter()
        .copied()
        .filter(|edge| !edge.is_conditional())
        .collect();
    if unconditional.is_empty() {
        return None;
    }

    // Step 2: preferred label
    if let Some(preferred) = outcome.preferred_label.as_deref() {
        let preferred = normalize_label(preferred);
        if !preferred.is_empty() {
            if let Some(edge) = unconditional
                .iter()
                .copied()
                .find(|edge| normalize_label(edge.label_text()) == preferred)
            {
                return Some(EdgeSelection {
                    edge,
                    reason: SelectionReason::PreferredLabel,
                });
            }
        }
    }

    // Step 3: suggested next ids
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = unconditional
            .iter()
            .copied()
            .find(|edge| edge.to == *suggested)
        {
            return Some(EdgeSelection {
                edge,
                reason: SelectionReason::SuggestedNextId,
            });
        }
    }

    // Step 4/5: weight, then smallest target id
    let best_weight = unconditional
        .iter()
        .map(|edge| edge.weight)
        .max_by(f64::total_cmp)?;
    let heaviest: Vec<&'a Edge> = unconditional
        .into_iter()
        .filter(|edge| edge.weight.total_cmp(&best_weight).is_eq())
        .collect();
    let reason = if heaviest.len() == 1 {
        SelectionReason::Weight
    } else {
        SelectionReason::LexicalTiebreak
    };
    heaviest
        .into_iter()
        .min_by(|left, right| left.to.cmp(&right.to))
        .map(|edge| EdgeSelection { edge, reason })
}

/// Lowercases, trims and strips accelerator prefixes such as `[Y] `,
/// `Y) ` and `Y - `.
pub fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }

    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-'
    {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}
