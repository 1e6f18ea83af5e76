//! Fan-out/fan-in execution.
//!
//! A fan-out node spawns one tokio task per outgoing edge. Each branch walks
//! its own sub-graph with a private copy of the context until it reaches the
//! matching fan-in; the join policy decides when enough branches are done and
//! consolidation picks the result the fan-in node carries forward.

use crate::cancel::{BranchGroup, CancellationToken};
use crate::runner::{ExecutionEnv, Route, absorb_outcome};
use crate::{
    Context, EngineError, Node, NodeOutcome, NodeStatus, ParallelEvent, PipelineFailure,
    RuntimeContext, RuntimeEventKind,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub mod consolidate;
pub mod policy;
pub mod subgraph;

pub use consolidate::{
    BRANCH_SCORE_KEY, Consolidation, branch_score, compare_branches, consolidate,
};
pub use policy::{
    DEFAULT_QUORUM_FRACTION, ErrorPolicy, JoinDecision, JoinPolicy, JoinTracker, ParallelSettings,
};
pub use subgraph::{BranchPlan, FanOutPlan, find_fan_in, plan_fan_out};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelPhase {
    Idle,
    BranchesRunning,
    Joining,
    Consolidated,
    Cancelled,
    Failed,
}

impl ParallelPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BranchesRunning => "branches_running",
            Self::Joining => "joining",
            Self::Consolidated => "consolidated",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BranchResult {
    pub branch_id: String,
    pub branch_index: usize,
    pub entry_node: String,
    /// Outcome of the last node the branch executed.
    pub outcome: NodeOutcome,
    /// The branch's private context when it stopped.
    pub context: Context,
    /// Every handler update the branch made, later writes winning.
    pub context_updates: RuntimeContext,
    pub completed_nodes: Vec<String>,
    pub duration: Duration,
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParallelReport {
    pub fan_out_node: String,
    pub fan_in_node: String,
    pub phase: ParallelPhase,
    /// Outcome recorded for the fan-in node.
    pub outcome: NodeOutcome,
    /// Finished branches in completion order.
    pub results: Vec<BranchResult>,
    pub best_branch: Option<String>,
    /// Set when the join policy became unsatisfiable.
    pub join_failure: Option<PipelineFailure>,
}

impl ParallelReport {
    /// Outcome recorded for the fan-out node itself.
    pub fn fan_out_outcome(&self) -> NodeOutcome {
        match self.phase {
            ParallelPhase::Consolidated => NodeOutcome::success().with_notes(format!(
                "{} branch(es) joined at '{}'",
                self.results.len(),
                self.fan_in_node
            )),
            _ => NodeOutcome::failure(
                self.outcome
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("fan-out ended {}", self.phase.as_str())),
            ),
        }
    }
}

const BRANCH_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

fn branch_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add((index as u64 + 1).wrapping_mul(BRANCH_SEED_STRIDE))
}

/// Runs every branch of `fan_out` against a frozen copy of `context`.
/// Boxed because branches may contain nested fan-outs.
pub(crate) fn run_fan_out<'a>(
    env: &'a ExecutionEnv,
    fan_out: &'a Node,
    context: &'a Context,
    cancel: &'a CancellationToken,
    seed: u64,
) -> BoxFuture<'a, Result<ParallelReport, EngineError>> {
    async move {
        let plan = plan_fan_out(&env.graph, &fan_out.id)?;
        let settings = ParallelSettings::from_node(fan_out, &env.config).map_err(|reason| {
            EngineError::InvalidGraph(format!("node '{}': {reason}", fan_out.id))
        })?;
        let total = plan.branches.len();

        env.events.emit(RuntimeEventKind::Parallel(ParallelEvent::Started {
            run_id: env.run_id.clone(),
            node_id: fan_out.id.clone(),
            fan_in_node: plan.fan_in_node.clone(),
            branch_count: total,
            join_policy: settings.join_policy.as_str().to_string(),
            error_policy: settings.error_policy.as_str().to_string(),
        }));
        tracing::info!(
            run_id = %env.run_id,
            node_id = %fan_out.id,
            fan_in = %plan.fan_in_node,
            branches = total,
            join_policy = settings.join_policy.as_str(),
            error_policy = settings.error_policy.as_str(),
            "fan-out started"
        );

        let mut tracker = JoinTracker::new(settings, total);
        let mut decision = tracker.initial();
        let group = BranchGroup::new(cancel);
        let permits = Arc::new(Semaphore::new(
            settings.max_parallel.unwrap_or(total).min(total).max(1),
        ));
        let snapshot = Arc::new(context.clone());
        let fan_in = Arc::new(plan.fan_in_node.clone());

        let mut tasks = JoinSet::new();
        if !decision.is_final() {
            for (index, branch) in plan.branches.iter().cloned().enumerate() {
                let env = env.clone();
                let permits = Arc::clone(&permits);
                let snapshot = Arc::clone(&snapshot);
                let fan_in = Arc::clone(&fan_in);
                let token = group.branch_token();
                let fan_out_id = fan_out.id.clone();
                let seed = branch_seed(seed, index);
                tasks.spawn(async move {
                    let _permit = tokio::select! {
                        permit = permits.acquire_owned() => permit.map_err(|error| {
                            EngineError::Runtime(format!("branch semaphore closed: {error}"))
                        })?,
                        _ = token.cancelled() => {
                            return Ok(cancelled_before_start(branch, index, &snapshot));
                        }
                    };
                    env.events.emit(RuntimeEventKind::Parallel(ParallelEvent::BranchStarted {
                        run_id: env.run_id.clone(),
                        node_id: fan_out_id,
                        branch_id: branch.branch_id.clone(),
                        branch_index: index,
                        target_node: branch.entry_node.clone(),
                    }));
                    run_branch(
                        &env,
                        branch,
                        index,
                        (*snapshot).clone(),
                        fan_in.as_str(),
                        token,
                        seed,
                    )
                    .await
                });
            }
        }

        let mut phase = ParallelPhase::Joining;
        let mut results = Vec::with_capacity(total);
        while !decision.is_final() {
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => {
                    group.cancel_remaining();
                    tasks.detach_all();
                    return Err(error);
                }
                Err(join_error) => {
                    group.cancel_remaining();
                    tasks.detach_all();
                    return Err(EngineError::Runtime(format!(
                        "branch of fan-out '{}' panicked: {join_error}",
                        fan_out.id
                    )));
                }
            };

            env.events.emit(RuntimeEventKind::Parallel(ParallelEvent::BranchCompleted {
                run_id: env.run_id.clone(),
                node_id: fan_out.id.clone(),
                branch_id: result.branch_id.clone(),
                branch_index: result.branch_index,
                status: result.outcome.status.as_str().to_string(),
                cancelled: result.cancelled,
                duration_ms: result.duration.as_millis() as u64,
            }));
            tracing::debug!(
                run_id = %env.run_id,
                node_id = %fan_out.id,
                branch_id = %result.branch_id,
                status = result.outcome.status.as_str(),
                cancelled = result.cancelled,
                "branch finished"
            );

            if result.cancelled {
                results.push(result);
                if group.parent_cancelled() {
                    phase = ParallelPhase::Cancelled;
                    break;
                }
                continue;
            }
            decision = tracker.record(result.outcome.status, &result.branch_id);
            results.push(result);
        }

        // In-flight branches stop at their next step; their results are dropped.
        group.cancel_remaining();
        tasks.detach_all();

        let drop_failures = settings.error_policy == ErrorPolicy::Ignore;
        let consolidation = consolidate(&plan.fan_in_node, total, &results, drop_failures);
        let mut join_failure = None;
        let (phase, outcome, best_branch) = match (phase, decision) {
            (ParallelPhase::Cancelled, _) => (
                ParallelPhase::Cancelled,
                failure_with_summary(
                    format!("fan-out '{}' cancelled", fan_out.id),
                    &consolidation.outcome.context_updates,
                ),
                None,
            ),
            (_, JoinDecision::FailFast { reason }) => (
                ParallelPhase::Failed,
                failure_with_summary(reason, &consolidation.outcome.context_updates),
                None,
            ),
            (
                _,
                JoinDecision::Unsatisfiable {
                    reason,
                    succeeded,
                    required,
                },
            ) => {
                join_failure = Some(PipelineFailure::JoinUnsatisfiable {
                    node_id: fan_out.id.clone(),
                    policy: settings.join_policy.as_str().to_string(),
                    succeeded,
                    required,
                });
                (
                    ParallelPhase::Failed,
                    failure_with_summary(reason, &consolidation.outcome.context_updates),
                    None,
                )
            }
            _ if consolidation.outcome.status == NodeStatus::Fail => (
                ParallelPhase::Failed,
                consolidation.outcome,
                consolidation.best_branch,
            ),
            _ => (
                ParallelPhase::Consolidated,
                consolidation.outcome,
                consolidation.best_branch,
            ),
        };

        env.events.emit(RuntimeEventKind::Parallel(ParallelEvent::Completed {
            run_id: env.run_id.clone(),
            node_id: fan_out.id.clone(),
            phase: phase.as_str().to_string(),
            success_count: tracker.succeeded(),
            failure_count: tracker.failed(),
            best_branch: best_branch.clone(),
        }));
        tracing::info!(
            run_id = %env.run_id,
            node_id = %fan_out.id,
            phase = phase.as_str(),
            succeeded = tracker.succeeded(),
            failed = tracker.failed(),
            best_branch = best_branch.as_deref().unwrap_or(""),
            "fan-out joined"
        );

        Ok(ParallelReport {
            fan_out_node: fan_out.id.clone(),
            fan_in_node: plan.fan_in_node,
            phase,
            outcome,
            results,
            best_branch,
            join_failure,
        })
    }
    .boxed()
}

fn failure_with_summary(reason: String, updates: &RuntimeContext) -> NodeOutcome {
    let mut outcome = NodeOutcome::failure(reason);
    outcome.context_updates = updates
        .iter()
        .filter(|(key, _)| key.starts_with("parallel."))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    outcome
}

fn cancelled_before_start(branch: BranchPlan, index: usize, snapshot: &Context) -> BranchResult {
    BranchResult {
        branch_id: branch.branch_id,
        branch_index: index,
        entry_node: branch.entry_node,
        outcome: NodeOutcome::failure("branch cancelled before start"),
        context: snapshot.clone(),
        context_updates: RuntimeContext::new(),
        completed_nodes: Vec::new(),
        duration: Duration::ZERO,
        cancelled: true,
    }
}

/// Walks one branch until it reaches `fan_in`, runs out of edges, fails
/// without a route, or is cancelled between steps.
async fn run_branch(
    env: &ExecutionEnv,
    branch: BranchPlan,
    index: usize,
    mut context: Context,
    fan_in: &str,
    cancel: CancellationToken,
    seed: u64,
) -> Result<BranchResult, EngineError> {
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut updates = RuntimeContext::new();
    let mut completed_nodes = Vec::new();
    let mut outcome = NodeOutcome::success();
    let mut reroutes = 0u32;
    let mut cancelled = false;
    let mut current = branch.entry_node.clone();

    loop {
        if current == fan_in {
            break;
        }
        if !branch.nodes.contains(&current) {
            outcome = NodeOutcome::failure(format!(
                "branch '{}' left its sub-graph at '{current}'",
                branch.branch_id
            ));
            break;
        }
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let graph = Arc::clone(&env.graph);
        let node = graph.node(&current)?;
        let route_from = if node.is_fan_out() {
            let report = run_fan_out(env, node, &context, &cancel, rng.next_u64()).await?;
            if report.phase == ParallelPhase::Cancelled {
                cancelled = true;
                break;
            }
            absorb_outcome(&mut context, &report.outcome)?;
            updates.extend(report.outcome.context_updates.clone());
            completed_nodes.push(node.id.clone());
            completed_nodes.push(report.fan_in_node.clone());
            outcome = report.outcome;
            graph.node(&report.fan_in_node)?
        } else {
            let stage = env
                .execute_stage(node, &context, Some(&branch.branch_id), &mut rng)
                .await?;
            absorb_outcome(&mut context, &stage.outcome)?;
            updates.extend(stage.outcome.context_updates.clone());
            completed_nodes.push(node.id.clone());
            outcome = stage.outcome;
            node
        };

        match env.route_after(route_from, &outcome, &context)? {
            Route::Next { target, reroute } => {
                if reroute {
                    reroutes += 1;
                    if reroutes > env.reroute_limit {
                        outcome = NodeOutcome::failure(format!(
                            "branch '{}' exceeded reroute limit {}",
                            branch.branch_id, env.reroute_limit
                        ));
                        break;
                    }
                }
                current = target;
            }
            Route::End | Route::Terminate { .. } => break,
        }
    }

    Ok(BranchResult {
        branch_id: branch.branch_id,
        branch_index: index,
        entry_node: branch.entry_node,
        outcome: if cancelled {
            NodeOutcome::failure("branch cancelled")
        } else {
            outcome
        },
        context,
        context_updates: updates,
        completed_nodes,
        duration: started.elapsed(),
        cancelled,
    })
}
