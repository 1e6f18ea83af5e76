use async_trait::async_trait;
use conduit_engine::{
    Context, DEFAULT_SHAPE, Edge, EngineConfig, EngineError, Graph, GraphBuilder, HandlerRegistry,
    Node, NodeHandler, NodeOutcome, NodeStatus, PipelineFailure, PipelineRunner, PipelineStatus,
    RunConfig, SHAPE_CONDITIONAL, SHAPE_EXIT, SHAPE_START,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Returns queued outcomes per node id, then plain success.
#[derive(Default)]
struct ScriptedHandler {
    scripts: Mutex<BTreeMap<String, VecDeque<NodeOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn script(mut self, node_id: &str, outcomes: Vec<NodeOutcome>) -> Self {
        self.scripts
            .get_mut()
            .expect("mutex")
            .insert(node_id.to_string(), outcomes.into());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mutex").clone()
    }

    fn call_count(&self, node_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == node_id).count()
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    async fn handle(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        self.calls.lock().expect("mutex").push(node.id.clone());
        let next = self
            .scripts
            .lock()
            .expect("mutex")
            .get_mut(&node.id)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(NodeOutcome::success))
    }
}

fn runner(handler: Arc<ScriptedHandler>, config: EngineConfig) -> PipelineRunner {
    PipelineRunner::new(
        EngineConfig {
            jitter_seed: Some(7),
            ..config
        },
        HandlerRegistry::with_builtins().with_handler(DEFAULT_SHAPE, handler),
    )
}

fn base(id: &str) -> GraphBuilder {
    GraphBuilder::new(id)
        .node(Node::new("start", SHAPE_START))
        .node(Node::new("exit", SHAPE_EXIT))
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test(flavor = "current_thread")]
async fn run_conditional_gate_success_expected_success_branch_then_exit() {
    let graph = base("gate")
        .node(Node::new("work", DEFAULT_SHAPE))
        .node(Node::new("gate", SHAPE_CONDITIONAL))
        .node(Node::new("success", DEFAULT_SHAPE))
        .node(Node::new("failure", DEFAULT_SHAPE))
        .chain(&["start", "work", "gate"])
        .edge(Edge::new("gate", "success").with_condition("outcome=success"))
        .edge(Edge::new("gate", "failure").with_condition("outcome!=success"))
        .edge(Edge::new("success", "exit"))
        .edge(Edge::new("failure", "exit"))
        .build();
    let handler = Arc::new(ScriptedHandler::default());

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.completed_nodes,
        ids(&["start", "work", "gate", "success", "exit"])
    );
    assert_eq!(handler.calls(), ids(&["work", "success"]));
    assert_eq!(result.run_id, "gate-run");
    assert!(result.session_id.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn run_max_retries_two_with_fail_fail_success_expected_two_retries_and_success() {
    let graph = base("retry")
        .node(
            Node::new("work", DEFAULT_SHAPE)
                .with_attr("max_retries", 2)
                .with_attr("backoff_policy", "none"),
        )
        .chain(&["start", "work", "exit"])
        .build();
    let handler = Arc::new(ScriptedHandler::default().script(
        "work",
        vec![
            NodeOutcome::failure("first"),
            NodeOutcome::failure("second"),
            NodeOutcome::success(),
        ],
    ));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.call_count("work"), 3);
    assert_eq!(result.node_retries.get("work"), Some(&2));
    assert_eq!(result.node_outcomes["work"].status, NodeStatus::Success);
}

#[tokio::test(flavor = "current_thread")]
async fn run_retries_exhausted_without_route_expected_pipeline_termination() {
    let graph = base("exhaust")
        .node(
            Node::new("work", DEFAULT_SHAPE)
                .with_attr("max_retries", 1)
                .with_attr("backoff_policy", "none"),
        )
        .chain(&["start", "work", "exit"])
        .build();
    let handler = Arc::new(ScriptedHandler::default().script(
        "work",
        vec![NodeOutcome::failure("one"), NodeOutcome::failure("two")],
    ));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert_eq!(handler.call_count("work"), 2);
    assert!(matches!(
        result.failure,
        Some(PipelineFailure::PipelineTermination { ref node_id, .. }) if node_id == "work"
    ));
    assert!(
        result
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("two"))
    );
    assert!(!result.completed_nodes.contains(&"exit".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn run_failure_with_fail_edge_and_retry_target_expected_fail_edge_taken() {
    let graph = base("fail-edge")
        .node(Node::new("work", DEFAULT_SHAPE).with_attr("retry_target", "fixup"))
        .node(Node::new("recover", DEFAULT_SHAPE))
        .node(Node::new("fixup", DEFAULT_SHAPE))
        .chain(&["start", "work", "exit"])
        .edge(Edge::new("work", "recover").with_condition("outcome=fail"))
        .edge(Edge::new("recover", "exit"))
        .edge(Edge::new("fixup", "work"))
        .build();
    let handler =
        Arc::new(ScriptedHandler::default().script("work", vec![NodeOutcome::failure("broken")]));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.completed_nodes,
        ids(&["start", "work", "recover", "exit"])
    );
    assert_eq!(handler.call_count("fixup"), 0);
    assert_eq!(result.reroute_count, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn run_failure_with_only_retry_target_expected_jump_counted_as_reroute() {
    let graph = base("retry-target")
        .node(Node::new("work", DEFAULT_SHAPE).with_attr("retry_target", "fixup"))
        .node(Node::new("fixup", DEFAULT_SHAPE))
        .chain(&["start", "work", "exit"])
        .edge(Edge::new("fixup", "work"))
        .build();
    let handler =
        Arc::new(ScriptedHandler::default().script("work", vec![NodeOutcome::failure("broken")]));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.calls(), ids(&["work", "fixup", "work"]));
    assert_eq!(result.reroute_count, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn run_goal_gate_partial_success_expected_satisfied() {
    let graph = base("partial")
        .node(Node::new("review", DEFAULT_SHAPE).with_attr("goal_gate", true))
        .graph_attr("retry_target", "review")
        .chain(&["start", "review", "exit"])
        .build();
    let handler = Arc::new(
        ScriptedHandler::default().script("review", vec![NodeOutcome::partial_success()]),
    );

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.call_count("review"), 1);
    assert_eq!(result.reroute_count, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn run_goal_gate_failed_at_exit_expected_reroute_then_success() {
    let graph = base("gate-reroute")
        .node(
            Node::new("work", DEFAULT_SHAPE)
                .with_attr("goal_gate", true)
                .with_attr("retry_target", "work"),
        )
        .node(Node::new("review", DEFAULT_SHAPE))
        .chain(&["start", "work", "review", "exit"])
        .edge(Edge::new("work", "exit").with_condition("outcome=fail"))
        .build();
    let handler = Arc::new(
        ScriptedHandler::default().script("work", vec![NodeOutcome::failure("not yet")]),
    );

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.completed_nodes,
        ids(&["start", "work", "exit", "work", "review", "exit"])
    );
    assert_eq!(result.reroute_count, 1);
    assert_eq!(result.node_outcomes["work"].status, NodeStatus::Success);
}

#[tokio::test(flavor = "current_thread")]
async fn run_goal_gate_never_satisfied_expected_reroute_limit_failure() {
    let graph = base("gate-loop")
        .node(
            Node::new("work", DEFAULT_SHAPE)
                .with_attr("goal_gate", true)
                .with_attr("retry_target", "work"),
        )
        .chain(&["start", "work", "exit"])
        .edge(Edge::new("work", "exit").with_condition("outcome=fail"))
        .build();
    let handler = Arc::new(ScriptedHandler::default().script(
        "work",
        vec![
            NodeOutcome::failure("1"),
            NodeOutcome::failure("2"),
            NodeOutcome::failure("3"),
        ],
    ));

    let result = runner(
        Arc::clone(&handler),
        EngineConfig {
            reroute_limit: Some(1),
            ..EngineConfig::default()
        },
    )
    .run(Arc::new(graph), RunConfig::default())
    .await
    .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert_eq!(
        result.failure,
        Some(PipelineFailure::RerouteLimitExceeded {
            limit: 1,
            trail: ids(&["work", "work"]),
        })
    );
    assert_eq!(handler.call_count("work"), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn run_goal_gate_without_any_target_expected_unsatisfied_failure() {
    let graph = base("gate-dead")
        .node(Node::new("work", DEFAULT_SHAPE).with_attr("goal_gate", true))
        .chain(&["start", "work", "exit"])
        .edge(Edge::new("work", "exit").with_condition("outcome=fail"))
        .build();
    let handler =
        Arc::new(ScriptedHandler::default().script("work", vec![NodeOutcome::failure("no")]));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert_eq!(
        result.failure,
        Some(PipelineFailure::GoalGateUnsatisfied {
            gates: ids(&["work"])
        })
    );
}

#[tokio::test(flavor = "current_thread")]
async fn run_preferred_label_expected_matching_edge_over_weight() {
    let graph = base("label")
        .node(Node::new("work", DEFAULT_SHAPE))
        .node(Node::new("fix", DEFAULT_SHAPE))
        .node(Node::new("ship", DEFAULT_SHAPE))
        .chain(&["start", "work"])
        .edge(Edge::new("work", "fix").with_label("Fix").with_weight(10.0))
        .edge(Edge::new("work", "ship").with_label("[S] Ship"))
        .edge(Edge::new("fix", "exit"))
        .edge(Edge::new("ship", "exit"))
        .build();
    let handler = Arc::new(ScriptedHandler::default().script(
        "work",
        vec![NodeOutcome::success().with_preferred_label("ship")],
    ));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(handler.calls(), ids(&["work", "ship"]));
    assert_eq!(result.context.get("preferred_label"), Some(&json!("ship")));
}

#[tokio::test(flavor = "current_thread")]
async fn run_context_updates_expected_visible_to_later_conditions() {
    let graph = base("context")
        .graph_attr("goal", "ship it")
        .node(Node::new("plan", DEFAULT_SHAPE))
        .node(Node::new("fast", DEFAULT_SHAPE))
        .node(Node::new("slow", DEFAULT_SHAPE))
        .chain(&["start", "plan"])
        .edge(Edge::new("plan", "fast").with_condition("context.plan.mode=fast"))
        .edge(Edge::new("plan", "slow"))
        .edge(Edge::new("fast", "exit"))
        .edge(Edge::new("slow", "exit"))
        .build();
    let handler = Arc::new(ScriptedHandler::default().script(
        "plan",
        vec![NodeOutcome::success().with_update("plan.mode", json!("fast"))],
    ));

    let result = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(handler.calls(), ids(&["plan", "fast"]));
    assert_eq!(result.context.get("plan.mode"), Some(&json!("fast")));
    assert_eq!(result.context.get("graph.goal"), Some(&json!("ship it")));
    assert_eq!(result.context.get("outcome"), Some(&json!("success")));
}

#[tokio::test(flavor = "current_thread")]
async fn run_invalid_graph_expected_validation_error_before_any_stage() {
    let graph = GraphBuilder::new("broken")
        .node(Node::new("work", DEFAULT_SHAPE))
        .node(Node::new("exit", SHAPE_EXIT))
        .chain(&["work", "exit"])
        .build();
    let handler = Arc::new(ScriptedHandler::default());

    let error = runner(Arc::clone(&handler), EngineConfig::default())
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect_err("run should be rejected");

    match error {
        EngineError::Validation(validation) => assert!(validation.has_rule("start_node")),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(handler.calls().is_empty());
}
