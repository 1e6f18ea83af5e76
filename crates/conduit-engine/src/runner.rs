use crate::cancel::CancellationToken;
use crate::events::{EventEmitter, timestamp_now};
use crate::parallel::{ParallelPhase, run_fan_out};
use crate::storage::RunStorage;
use crate::{
    AttrValue, CheckpointEvent, CheckpointMetadata, CheckpointState, Context, EngineConfig,
    EngineError, FailureRoute, GoalGateCheck, GoalGateEvent, Graph, HandlerRegistry, Node,
    NodeOutcome, NodeStatus, PipelineEvent, PipelineFailure, PipelineRunResult, PipelineState,
    PipelineStatus, RetryListener, RetrySignal, RunConfig, RunState, RuntimeEventKind, StageEvent,
    build_retry_policy, check_goal_gates, execute_with_retry, resolve_failure_route,
    resolve_resume_state, select_next_edge, validate_context_key, validate_or_raise,
};
use async_trait::async_trait;
use conduit_turnstore::ContextId;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Drives a graph from its start node (or a checkpoint) to completion.
#[derive(Clone)]
pub struct PipelineRunner {
    config: Arc<EngineConfig>,
    handlers: Arc<HandlerRegistry>,
}

impl PipelineRunner {
    pub fn new(config: EngineConfig, handlers: HandlerRegistry) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Arc::new(handlers),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Validation and storage failures are returned as `Err`. Everything
    /// that goes wrong while the graph runs ends up in the result instead.
    pub async fn run(
        &self,
        graph: Arc<Graph>,
        config: RunConfig,
    ) -> Result<PipelineRunResult, EngineError> {
        self.config.validate()?;
        validate_or_raise(&graph, &self.handlers, &self.config)?;

        let RunConfig {
            run_id,
            storage,
            resume_session,
            events,
            cancel,
        } = config;
        let events = EventEmitter::new(events);

        let (storage, state) = match resume_session {
            Some(session) => {
                let writer = storage.ok_or_else(|| {
                    EngineError::Config("resuming a run requires a storage writer".to_string())
                })?;
                let resume = resolve_resume_state(&graph, writer.as_ref(), &session).await?;
                let run_id = run_id.unwrap_or_else(|| resume.checkpoint.metadata.run_id.clone());
                let storage =
                    RunStorage::attach(writer, run_id.clone(), session, resume.last_sequence_no);

                if let Some(status) = resume.terminal_status {
                    tracing::info!(
                        run_id = %run_id,
                        status = status.as_str(),
                        "resumed run already finished"
                    );
                    return Ok(build_result(
                        &storage,
                        status,
                        resume.checkpoint.terminal_failure.clone(),
                        resume.state,
                    ));
                }

                events.emit(RuntimeEventKind::Pipeline(PipelineEvent::Resumed {
                    run_id: run_id.clone(),
                    graph_id: graph.id().to_string(),
                    checkpoint_id: resume.checkpoint.metadata.checkpoint_id.clone(),
                    next_node: resume.next_node.clone(),
                }));
                storage
                    .append_run_event(
                        "run_resumed",
                        json!({
                            "graph_id": graph.id(),
                            "checkpoint_id": resume.checkpoint.metadata.checkpoint_id,
                            "next_node": resume.next_node,
                        }),
                    )
                    .await?;
                tracing::info!(
                    run_id = %run_id,
                    graph_id = %graph.id(),
                    next_node = %resume.state.current_node,
                    "pipeline resumed"
                );
                (storage, resume.state)
            }
            None => {
                let run_id = run_id.unwrap_or_else(|| format!("{}-run", graph.id()));
                let storage = RunStorage::open(storage, run_id.clone()).await?;
                let start = graph.start_node().ok_or_else(|| {
                    EngineError::InvalidGraph("graph does not have a single start node".to_string())
                })?;

                events.emit(RuntimeEventKind::Pipeline(PipelineEvent::Started {
                    run_id: run_id.clone(),
                    graph_id: graph.id().to_string(),
                }));
                storage
                    .append_run_event("run_started", json!({ "graph_id": graph.id() }))
                    .await?;
                tracing::info!(run_id = %run_id, graph_id = %graph.id(), "pipeline started");
                (
                    storage,
                    RunState::new(start.id.clone(), mirror_graph_attributes(&graph)),
                )
            }
        };

        let env = ExecutionEnv {
            run_id: storage.run_id().to_string(),
            reroute_limit: self.config.reroute_limit(&graph),
            graph,
            handlers: Arc::clone(&self.handlers),
            config: Arc::clone(&self.config),
            events,
            storage,
            stage_counter: Arc::new(AtomicU64::new(0)),
        };
        let seed = self.config.jitter_seed.unwrap_or_else(rand::random);
        RunLoop {
            env,
            state,
            cancel,
            rng: StdRng::seed_from_u64(seed),
            phase: PipelineState::Running,
        }
        .drive()
        .await
    }
}

/// Where the run goes after a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Next { target: String, reroute: bool },
    /// No outgoing edge matched; treated as reaching the exit.
    End,
    Terminate { node_id: String, reason: String },
}

pub(crate) struct StageRun {
    pub(crate) outcome: NodeOutcome,
    pub(crate) attempts: u32,
}

/// Everything a stage needs, shared by the runner and every branch task.
#[derive(Clone)]
pub(crate) struct ExecutionEnv {
    pub(crate) graph: Arc<Graph>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) events: EventEmitter,
    pub(crate) storage: RunStorage,
    pub(crate) run_id: String,
    pub(crate) reroute_limit: u32,
    stage_counter: Arc<AtomicU64>,
}

impl ExecutionEnv {
    /// Runs one node through its handler with retries, emitting stage events
    /// and stage turns around it.
    pub(crate) async fn execute_stage(
        &self,
        node: &Node,
        context: &Context,
        branch_id: Option<&str>,
        rng: &mut StdRng,
    ) -> Result<StageRun, EngineError> {
        let stage_attempt_id = format!(
            "{}:{}",
            node.id,
            self.stage_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.events
            .emit(RuntimeEventKind::Stage(StageEvent::Started {
                run_id: self.run_id.clone(),
                node_id: node.id.clone(),
                branch_id: branch_id.map(str::to_string),
                stage_attempt_id: stage_attempt_id.clone(),
            }));
        self.storage
            .append_stage_event(
                &node.id,
                &stage_attempt_id,
                branch_id,
                "stage_started",
                json!({ "node_id": node.id, "branch_id": branch_id }),
            )
            .await?;

        let handler = self.handlers.resolve_or_err(node)?;
        let policy = build_retry_policy(node, &self.graph, &self.config);
        let listener = StageRetryListener {
            env: self,
            stage_attempt_id: &stage_attempt_id,
            branch_id,
        };
        let execution = execute_with_retry(
            node,
            handler.as_ref(),
            context,
            &self.graph,
            &policy,
            rng,
            &listener,
        )
        .await?;
        let outcome = reject_invalid_updates(execution.outcome);

        if outcome.status == NodeStatus::Fail {
            self.events
                .emit(RuntimeEventKind::Stage(StageEvent::Failed {
                    run_id: self.run_id.clone(),
                    node_id: node.id.clone(),
                    branch_id: branch_id.map(str::to_string),
                    stage_attempt_id: stage_attempt_id.clone(),
                    attempts: execution.attempts,
                    reason: outcome.failure_reason.clone(),
                }));
            tracing::warn!(
                run_id = %self.run_id,
                node_id = %node.id,
                branch_id = branch_id.unwrap_or(""),
                attempts = execution.attempts,
                reason = outcome.failure_reason.as_deref().unwrap_or(""),
                "stage failed"
            );
        } else {
            self.events
                .emit(RuntimeEventKind::Stage(StageEvent::Completed {
                    run_id: self.run_id.clone(),
                    node_id: node.id.clone(),
                    branch_id: branch_id.map(str::to_string),
                    stage_attempt_id: stage_attempt_id.clone(),
                    status: outcome.status.as_str().to_string(),
                    attempts: execution.attempts,
                    notes: outcome.notes.clone(),
                }));
            tracing::info!(
                run_id = %self.run_id,
                node_id = %node.id,
                branch_id = branch_id.unwrap_or(""),
                status = outcome.status.as_str(),
                attempts = execution.attempts,
                "stage completed"
            );
        }

        let completion_kind = if outcome.status == NodeStatus::Fail {
            "stage_failed"
        } else {
            "stage_completed"
        };
        self.storage
            .append_stage_event(
                &node.id,
                &stage_attempt_id,
                branch_id,
                completion_kind,
                json!({
                    "node_id": node.id,
                    "status": outcome.status.as_str(),
                    "attempts": execution.attempts,
                    "notes": outcome.notes,
                    "failure_reason": outcome.failure_reason,
                }),
            )
            .await?;

        Ok(StageRun {
            outcome,
            attempts: execution.attempts,
        })
    }

    /// Edge selection for non-failing outcomes, failure routing for `FAIL`.
    pub(crate) fn route_after(
        &self,
        node: &Node,
        outcome: &NodeOutcome,
        context: &Context,
    ) -> Result<Route, EngineError> {
        if outcome.status == NodeStatus::Fail {
            let route = resolve_failure_route(&self.graph, node, outcome, context);
            tracing::debug!(
                run_id = %self.run_id,
                node_id = %node.id,
                route = ?route,
                "failure route resolved"
            );
            return Ok(match route {
                FailureRoute::Terminate { node_id, reason } => Route::Terminate { node_id, reason },
                other => Route::Next {
                    reroute: other.is_reroute(),
                    target: other.target().unwrap_or_default().to_string(),
                },
            });
        }

        Ok(match select_next_edge(&self.graph, &node.id, outcome, context)? {
            Some(selection) => {
                tracing::debug!(
                    run_id = %self.run_id,
                    from = %node.id,
                    to = %selection.edge.to,
                    reason = selection.reason.as_str(),
                    "edge selected"
                );
                Route::Next {
                    target: selection.edge.to.clone(),
                    reroute: false,
                }
            }
            None => Route::End,
        })
    }
}

/// Applies an outcome to a context: its updates first, then the routing
/// keys `outcome` and `preferred_label`.
pub(crate) fn absorb_outcome(
    context: &mut Context,
    outcome: &NodeOutcome,
) -> Result<(), EngineError> {
    context.apply_updates(&outcome.context_updates)?;
    context.set("outcome", Value::String(outcome.status.as_str().to_string()))?;
    if let Some(label) = outcome.preferred_label.as_ref() {
        context.set("preferred_label", Value::String(label.clone()))?;
    }
    Ok(())
}

fn reject_invalid_updates(outcome: NodeOutcome) -> NodeOutcome {
    let invalid = outcome
        .context_updates
        .keys()
        .find_map(|key| validate_context_key(key).err());
    match invalid {
        Some(error) => NodeOutcome::failure(format!("handler returned an invalid update: {error}")),
        None => outcome,
    }
}

struct StageRetryListener<'a> {
    env: &'a ExecutionEnv,
    stage_attempt_id: &'a str,
    branch_id: Option<&'a str>,
}

#[async_trait]
impl<'a> RetryListener for StageRetryListener<'a> {
    async fn on_retry(&self, signal: &RetrySignal) -> Result<(), EngineError> {
        self.env
            .events
            .emit(RuntimeEventKind::Stage(StageEvent::Retrying {
                run_id: self.env.run_id.clone(),
                node_id: signal.node_id.clone(),
                branch_id: self.branch_id.map(str::to_string),
                stage_attempt_id: self.stage_attempt_id.to_string(),
                attempt: signal.attempt,
                max_attempts: signal.max_attempts,
                delay_ms: signal.delay.as_millis() as u64,
            }));
        tracing::debug!(
            run_id = %self.env.run_id,
            node_id = %signal.node_id,
            state = PipelineState::Retrying.as_str(),
            "stage retry scheduled"
        );
        self.env
            .storage
            .append_retrying(self.stage_attempt_id, self.branch_id, signal)
            .await
    }
}

enum ExitDecision {
    Finished(PipelineStatus, Option<PipelineFailure>),
    Rerouted,
}

/// The runner's state machine for a single run.
struct RunLoop {
    env: ExecutionEnv,
    state: RunState,
    cancel: CancellationToken,
    rng: StdRng,
    phase: PipelineState,
}

impl RunLoop {
    async fn drive(mut self) -> Result<PipelineRunResult, EngineError> {
        let graph = Arc::clone(&self.env.graph);

        let (status, failure) = loop {
            if self.cancel.is_cancelled() {
                return self.pause().await;
            }

            let node = graph.node(&self.state.current_node)?;
            if graph.is_terminal(node) {
                self.state.visited.push(node.id.clone());
                match self.reach_exit().await? {
                    ExitDecision::Finished(status, failure) => break (status, failure),
                    ExitDecision::Rerouted => continue,
                }
            }

            let mut join_failure = None;
            let (route_from, outcome) = if node.is_fan_out() {
                let mut report = run_fan_out(
                    &self.env,
                    node,
                    &self.state.context,
                    &self.cancel,
                    self.rng.next_u64(),
                )
                .await?;
                if report.phase == ParallelPhase::Cancelled {
                    return self.pause().await;
                }
                join_failure = report.join_failure.take();
                let fan_out_outcome = report.fan_out_outcome();
                absorb_outcome(&mut self.state.context, &fan_out_outcome)?;
                self.state.record_outcome(&node.id, fan_out_outcome, 0);
                absorb_outcome(&mut self.state.context, &report.outcome)?;
                self.state
                    .record_outcome(&report.fan_in_node, report.outcome.clone(), 0);
                self.state.current_node = report.fan_in_node.clone();
                (graph.node(&report.fan_in_node)?, report.outcome)
            } else {
                let stage = self
                    .env
                    .execute_stage(node, &self.state.context, None, &mut self.rng)
                    .await?;
                absorb_outcome(&mut self.state.context, &stage.outcome)?;
                self.state.record_outcome(
                    &node.id,
                    stage.outcome.clone(),
                    stage.attempts.saturating_sub(1),
                );
                (node, stage.outcome)
            };

            match self
                .env
                .route_after(route_from, &outcome, &self.state.context)?
            {
                Route::Next { target, reroute } => {
                    if reroute {
                        self.enter(PipelineState::Rerouting);
                        if !self.state.record_reroute(&target, self.env.reroute_limit) {
                            break (PipelineStatus::Fail, Some(self.reroute_limit_failure()));
                        }
                    }
                    self.save_checkpoint(Some(target.clone()), None).await?;
                    self.state.current_node = target;
                    self.enter(PipelineState::Running);
                }
                Route::End => match self.reach_exit().await? {
                    ExitDecision::Finished(status, failure) => break (status, failure),
                    ExitDecision::Rerouted => continue,
                },
                Route::Terminate { node_id, reason } => {
                    let failure = join_failure
                        .unwrap_or(PipelineFailure::PipelineTermination { node_id, reason });
                    break (PipelineStatus::Fail, Some(failure));
                }
            }
        };

        self.finish(status, failure).await
    }

    fn enter(&mut self, next: PipelineState) {
        if self.phase != next {
            tracing::debug!(
                run_id = %self.env.run_id,
                from = self.phase.as_str(),
                to = next.as_str(),
                "pipeline state changed"
            );
            self.phase = next;
        }
    }

    /// Goal-gate check at an exit. On reroute the state already points at
    /// the retry target.
    async fn reach_exit(&mut self) -> Result<ExitDecision, EngineError> {
        let graph = Arc::clone(&self.env.graph);
        match check_goal_gates(&graph, &self.state.visited, &self.state.node_outcomes) {
            GoalGateCheck::Satisfied => Ok(ExitDecision::Finished(PipelineStatus::Success, None)),
            GoalGateCheck::Unsatisfied { unsatisfied } => Ok(ExitDecision::Finished(
                PipelineStatus::Fail,
                Some(PipelineFailure::GoalGateUnsatisfied { gates: unsatisfied }),
            )),
            GoalGateCheck::Reroute {
                unsatisfied,
                target,
                source,
            } => {
                self.enter(PipelineState::Rerouting);
                if !self.state.record_reroute(&target, self.env.reroute_limit) {
                    return Ok(ExitDecision::Finished(
                        PipelineStatus::Fail,
                        Some(self.reroute_limit_failure()),
                    ));
                }
                self.env
                    .events
                    .emit(RuntimeEventKind::GoalGate(GoalGateEvent::Rerouted {
                        run_id: self.env.run_id.clone(),
                        unsatisfied: unsatisfied.clone(),
                        target: target.clone(),
                        reroute_count: self.state.reroute_count,
                    }));
                tracing::warn!(
                    run_id = %self.env.run_id,
                    unsatisfied = ?unsatisfied,
                    target = %target,
                    source = ?source,
                    reroute_count = self.state.reroute_count,
                    "goal gate unsatisfied, rerouting"
                );
                self.save_checkpoint(Some(target.clone()), None).await?;
                self.state.current_node = target;
                self.enter(PipelineState::Running);
                Ok(ExitDecision::Rerouted)
            }
        }
    }

    fn reroute_limit_failure(&self) -> PipelineFailure {
        PipelineFailure::RerouteLimitExceeded {
            limit: self.env.reroute_limit,
            trail: self.state.reroute_trail.clone(),
        }
    }

    async fn save_checkpoint(
        &self,
        next_node: Option<String>,
        terminal: Option<(PipelineStatus, Option<PipelineFailure>)>,
    ) -> Result<(), EngineError> {
        if self.env.storage.context_id().is_none() {
            return Ok(());
        }
        let sequence_no = self.env.storage.next_sequence_no();
        let mut checkpoint = CheckpointState::capture(
            CheckpointMetadata::new(self.env.run_id.clone(), sequence_no, timestamp_now()),
            &self.state,
            next_node,
        );
        if let Some((status, failure)) = terminal {
            checkpoint = checkpoint.with_terminal(status, failure);
        }
        self.env.storage.append_checkpoint(&checkpoint).await?;
        self.env
            .events
            .emit(RuntimeEventKind::Checkpoint(CheckpointEvent::Saved {
                run_id: self.env.run_id.clone(),
                node_id: checkpoint.current_node.clone(),
                checkpoint_id: checkpoint.metadata.checkpoint_id.clone(),
                sequence_no,
            }));
        Ok(())
    }

    /// Stops before the current node; resuming runs it.
    async fn pause(mut self) -> Result<PipelineRunResult, EngineError> {
        self.enter(PipelineState::Paused);
        let node_id = self.state.current_node.clone();
        self.save_checkpoint(Some(node_id.clone()), None).await?;
        self.env
            .events
            .emit(RuntimeEventKind::Pipeline(PipelineEvent::Paused {
                run_id: self.env.run_id.clone(),
                graph_id: self.env.graph.id().to_string(),
                node_id: node_id.clone(),
            }));
        self.env
            .storage
            .append_run_event("run_paused", json!({ "node_id": node_id }))
            .await?;
        tracing::info!(run_id = %self.env.run_id, node_id = %node_id, "pipeline paused");
        Ok(build_result(
            &self.env.storage,
            PipelineStatus::Paused,
            None,
            self.state,
        ))
    }

    async fn finish(
        mut self,
        status: PipelineStatus,
        failure: Option<PipelineFailure>,
    ) -> Result<PipelineRunResult, EngineError> {
        self.save_checkpoint(None, Some((status, failure.clone())))
            .await?;
        let graph_id = self.env.graph.id().to_string();
        match failure.as_ref() {
            None => {
                self.enter(PipelineState::Completed);
                self.env
                    .events
                    .emit(RuntimeEventKind::Pipeline(PipelineEvent::Completed {
                        run_id: self.env.run_id.clone(),
                        graph_id: graph_id.clone(),
                    }));
                tracing::info!(
                    run_id = %self.env.run_id,
                    visited = self.state.visited.len(),
                    "pipeline completed"
                );
            }
            Some(failure) => {
                self.enter(PipelineState::Failed);
                self.env
                    .events
                    .emit(RuntimeEventKind::Pipeline(PipelineEvent::Failed {
                        run_id: self.env.run_id.clone(),
                        graph_id: graph_id.clone(),
                        reason: failure.to_string(),
                    }));
                tracing::warn!(run_id = %self.env.run_id, reason = %failure, "pipeline failed");
            }
        }
        self.env
            .storage
            .append_run_event(
                "run_finalized",
                json!({
                    "graph_id": graph_id,
                    "status": status.as_str(),
                    "failure": failure,
                }),
            )
            .await?;

        Ok(build_result(&self.env.storage, status, failure, self.state))
    }
}

fn build_result(
    storage: &RunStorage,
    status: PipelineStatus,
    failure: Option<PipelineFailure>,
    state: RunState,
) -> PipelineRunResult {
    PipelineRunResult {
        run_id: storage.run_id().to_string(),
        session_id: storage.context_id().cloned(),
        status,
        failure_reason: failure.as_ref().map(ToString::to_string),
        failure,
        completed_nodes: state.visited,
        node_outcomes: state.node_outcomes,
        node_retries: state.node_retries,
        reroute_count: state.reroute_count,
        context: state.context.into_values(),
    }
}

/// Graph attributes are visible to conditions as `graph.<key>`.
fn mirror_graph_attributes(graph: &Graph) -> Context {
    let mut context = Context::new();
    for (key, value) in graph.attrs().values() {
        let value = match value {
            AttrValue::String(inner) => Value::String(inner.clone()),
            AttrValue::Integer(inner) => json!(inner),
            AttrValue::Float(inner) => json!(inner),
            AttrValue::Boolean(inner) => json!(inner),
        };
        if let Err(error) = context.set(format!("graph.{key}"), value) {
            tracing::debug!(key = %key, error = %error, "graph attribute not mirrored");
        }
    }
    context
}

/// Session id of a finished or paused run, for resuming later.
pub fn resume_config(result: &PipelineRunResult, base: RunConfig) -> Option<RunConfig> {
    let session: ContextId = result.session_id.clone()?;
    Some(RunConfig {
        run_id: Some(result.run_id.clone()),
        resume_session: Some(session),
        ..base
    })
}
