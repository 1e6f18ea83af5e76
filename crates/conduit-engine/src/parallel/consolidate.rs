use crate::parallel::BranchResult;
use crate::{NodeOutcome, NodeStatus, RuntimeContext};
use serde_json::{Value, json};
use std::cmp::Ordering;

/// Context update a branch uses to report its own quality.
pub const BRANCH_SCORE_KEY: &str = "score";

#[derive(Clone, Debug, PartialEq)]
pub struct Consolidation {
    pub outcome: NodeOutcome,
    pub best_branch: Option<String>,
    pub success_count: usize,
    pub fail_count: usize,
}

pub fn branch_score(result: &BranchResult) -> Option<f64> {
    result
        .context_updates
        .get(BRANCH_SCORE_KEY)
        .and_then(Value::as_f64)
}

/// Status rank first, then score (higher first), then branch id.
pub fn compare_branches(a: &BranchResult, b: &BranchResult) -> Ordering {
    let score = |result: &BranchResult| branch_score(result).unwrap_or(f64::NEG_INFINITY);
    b.outcome
        .status
        .rank()
        .cmp(&a.outcome.status.rank())
        .then_with(|| score(b).total_cmp(&score(a)))
        .then_with(|| a.branch_id.cmp(&b.branch_id))
}

/// Builds the fan-in outcome from the branches that are still eligible.
/// `results` holds every finished branch; cancelled ones never win.
pub fn consolidate(
    fan_in_node: &str,
    branch_count: usize,
    results: &[BranchResult],
    drop_failures: bool,
) -> Consolidation {
    let finished: Vec<&BranchResult> = results.iter().filter(|r| !r.cancelled).collect();
    let success_count = finished
        .iter()
        .filter(|r| r.outcome.status.is_success_like())
        .count();
    let fail_count = finished.len() - success_count;

    let mut eligible: Vec<&BranchResult> = finished
        .iter()
        .copied()
        .filter(|r| !drop_failures || r.outcome.status.is_success_like())
        .collect();
    eligible.sort_by(|a, b| compare_branches(a, b));

    let summaries: Vec<Value> = eligible
        .iter()
        .map(|result| {
            json!({
                "branch_id": result.branch_id,
                "status": result.outcome.status.as_str(),
                "score": branch_score(result),
                "failure_reason": result.outcome.failure_reason,
            })
        })
        .collect();

    let winner = eligible.first().copied();
    let mut updates: RuntimeContext = winner
        .map(|result| result.context_updates.clone())
        .unwrap_or_default();
    updates.insert("parallel.branch_count".to_string(), json!(branch_count));
    updates.insert("parallel.success_count".to_string(), json!(success_count));
    updates.insert("parallel.fail_count".to_string(), json!(fail_count));
    updates.insert("parallel.results".to_string(), Value::Array(summaries));
    updates.insert(
        "parallel.fan_in.best_id".to_string(),
        winner.map_or(Value::Null, |r| json!(r.branch_id)),
    );
    updates.insert(
        "parallel.fan_in.best_outcome".to_string(),
        winner.map_or(Value::Null, |r| json!(r.outcome.status.as_str())),
    );

    let outcome = match winner {
        Some(best) if best.outcome.status != NodeStatus::Fail => NodeOutcome {
            status: best.outcome.status,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            failure_reason: None,
            notes: Some(format!("best branch '{}'", best.branch_id)),
        },
        Some(best) => NodeOutcome {
            status: NodeStatus::Fail,
            context_updates: updates,
            failure_reason: Some(format!(
                "no branch into '{fan_in_node}' succeeded; best was '{}': {}",
                best.branch_id,
                best.outcome.failure_reason.as_deref().unwrap_or("failed")
            )),
            ..NodeOutcome::with_status(NodeStatus::Fail)
        },
        None => NodeOutcome {
            status: NodeStatus::Fail,
            context_updates: updates,
            failure_reason: Some(format!("no eligible branch reached '{fan_in_node}'")),
            ..NodeOutcome::with_status(NodeStatus::Fail)
        },
    };

    Consolidation {
        outcome,
        best_branch: winner.map(|result| result.branch_id.clone()),
        success_count,
        fail_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use std::time::Duration;

    fn result(branch_id: &str, outcome: NodeOutcome, score: Option<f64>) -> BranchResult {
        let mut context_updates = RuntimeContext::new();
        context_updates.insert(format!("{branch_id}.done"), json!(true));
        if let Some(score) = score {
            context_updates.insert(BRANCH_SCORE_KEY.to_string(), json!(score));
        }
        BranchResult {
            branch_id: branch_id.to_string(),
            branch_index: 0,
            entry_node: branch_id.to_string(),
            outcome,
            context: Context::new(),
            context_updates,
            completed_nodes: vec![branch_id.to_string()],
            duration: Duration::ZERO,
            cancelled: false,
        }
    }

    #[test]
    fn consolidate_status_then_score_then_id_expected_ranked_winner() {
        let results = vec![
            result("c", NodeOutcome::partial_success(), Some(9.0)),
            result("b", NodeOutcome::success(), Some(0.4)),
            result("a", NodeOutcome::success(), Some(0.7)),
            result("d", NodeOutcome::success(), None),
        ];

        let consolidated = consolidate("join", 4, &results, false);

        assert_eq!(consolidated.best_branch.as_deref(), Some("a"));
        assert_eq!(consolidated.outcome.status, NodeStatus::Success);
        let updates = &consolidated.outcome.context_updates;
        assert_eq!(updates.get("a.done"), Some(&json!(true)));
        assert!(updates.get("b.done").is_none());
        assert_eq!(updates.get("parallel.fan_in.best_id"), Some(&json!("a")));
        let order: Vec<_> = updates["parallel.results"]
            .as_array()
            .expect("results should be an array")
            .iter()
            .map(|entry| entry["branch_id"].clone())
            .collect();
        assert_eq!(order, vec![json!("a"), json!("b"), json!("d"), json!("c")]);
    }

    #[test]
    fn consolidate_equal_scores_expected_lexical_branch_id() {
        let results = vec![
            result("beta", NodeOutcome::success(), Some(1.0)),
            result("alpha", NodeOutcome::success(), Some(1.0)),
        ];
        let consolidated = consolidate("join", 2, &results, false);
        assert_eq!(consolidated.best_branch.as_deref(), Some("alpha"));
    }

    #[test]
    fn consolidate_drop_failures_expected_failures_excluded_but_counted() {
        let results = vec![
            result("a", NodeOutcome::failure("boom"), None),
            result("b", NodeOutcome::success(), None),
        ];
        let consolidated = consolidate("join", 2, &results, true);

        assert_eq!(consolidated.best_branch.as_deref(), Some("b"));
        assert_eq!((consolidated.success_count, consolidated.fail_count), (1, 1));
        assert_eq!(
            consolidated.outcome.context_updates["parallel.results"]
                .as_array()
                .map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn consolidate_no_eligible_branch_expected_fail() {
        let results = vec![result("a", NodeOutcome::failure("boom"), None)];
        let consolidated = consolidate("join", 1, &results, true);

        assert_eq!(consolidated.outcome.status, NodeStatus::Fail);
        assert!(consolidated.best_branch.is_none());
        assert_eq!(
            consolidated.outcome.context_updates["parallel.fan_in.best_id"],
            Value::Null
        );
    }
}
