use async_trait::async_trait;
use conduit_engine::{
    Context, DEFAULT_SHAPE, Edge, EngineConfig, EngineError, Graph, GraphBuilder, HandlerRegistry,
    Node, NodeHandler, NodeOutcome, PipelineFailure, PipelineRunner, PipelineStatus, RunConfig,
    RuntimeContext, SHAPE_EXIT, SHAPE_FAN_IN, SHAPE_FAN_OUT, SHAPE_START,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed outcome per node id. Records the context each node saw and how many
/// handlers were running at once.
#[derive(Default)]
struct BranchHandler {
    outcomes: BTreeMap<String, NodeOutcome>,
    blocked: BTreeSet<String>,
    delay: Option<Duration>,
    slow: BTreeMap<String, Duration>,
    seen: Mutex<BTreeMap<String, RuntimeContext>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl BranchHandler {
    fn outcome(mut self, node_id: &str, outcome: NodeOutcome) -> Self {
        self.outcomes.insert(node_id.to_string(), outcome);
        self
    }

    /// The node's handler never returns.
    fn block(mut self, node_id: &str) -> Self {
        self.blocked.insert(node_id.to_string());
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn slow(mut self, node_id: &str, delay: Duration) -> Self {
        self.slow.insert(node_id.to_string(), delay);
        self
    }

    fn seen(&self, node_id: &str) -> Option<RuntimeContext> {
        self.seen.lock().expect("mutex").get(node_id).cloned()
    }

    fn ran(&self) -> BTreeSet<String> {
        self.seen.lock().expect("mutex").keys().cloned().collect()
    }
}

#[async_trait]
impl NodeHandler for BranchHandler {
    async fn handle(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        self.seen
            .lock()
            .expect("mutex")
            .insert(node.id.clone(), context.values().clone());
        if self.blocked.contains(&node.id) {
            std::future::pending::<()>().await;
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.slow.get(&node.id).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(self
            .outcomes
            .get(&node.id)
            .cloned()
            .unwrap_or_else(NodeOutcome::success))
    }
}

fn runner(handler: Arc<BranchHandler>) -> PipelineRunner {
    PipelineRunner::new(
        EngineConfig {
            jitter_seed: Some(11),
            ..EngineConfig::default()
        },
        HandlerRegistry::with_builtins().with_handler(DEFAULT_SHAPE, handler),
    )
}

/// `start -> plan -> fan -> {branches} -> join -> exit`
fn fan_graph(fan: Node, branches: &[&str]) -> Graph {
    let mut builder = GraphBuilder::new("fan")
        .node(Node::new("start", SHAPE_START))
        .node(Node::new("plan", DEFAULT_SHAPE))
        .node(fan)
        .node(Node::new("join", SHAPE_FAN_IN))
        .node(Node::new("exit", SHAPE_EXIT))
        .chain(&["start", "plan", "fan"])
        .edge(Edge::new("join", "exit"));
    for branch in branches {
        builder = builder
            .node(Node::new(*branch, DEFAULT_SHAPE))
            .edge(Edge::new("fan", *branch))
            .edge(Edge::new(*branch, "join"));
    }
    builder.build()
}

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_k_of_n_two_of_three_expected_proceed_without_waiting_for_third() {
    let fan = Node::new("fan", SHAPE_FAN_OUT)
        .with_attr("join_policy", "k_of_n")
        .with_attr("k", 2);
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default().block("c"));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner(Arc::clone(&handler)).run(Arc::new(graph), RunConfig::default()),
    )
    .await
    .expect("run should not wait for the blocked branch")
    .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.context.get("parallel.success_count"), Some(&json!(2)));
    assert_eq!(result.context.get("parallel.branch_count"), Some(&json!(3)));
    assert!(result.completed_nodes.ends_with(&[
        "fan".to_string(),
        "join".to_string(),
        "exit".to_string()
    ]));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_continue_with_one_failure_expected_consolidated_from_successes() {
    let fan = Node::new("fan", SHAPE_FAN_OUT).with_attr("error_policy", "continue");
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("a", NodeOutcome::success().with_update("score", json!(0.4)))
            .outcome("b", NodeOutcome::failure("b broke"))
            .outcome("c", NodeOutcome::success().with_update("score", json!(0.8))),
    );

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.context.get("parallel.success_count"), Some(&json!(2)));
    assert_eq!(result.context.get("parallel.fail_count"), Some(&json!(1)));
    assert_eq!(result.context.get("parallel.fan_in.best_id"), Some(&json!("c")));
    assert_eq!(
        result.context.get("parallel.fan_in.best_outcome"),
        Some(&json!("success"))
    );
    let ranked: Vec<_> = result.context["parallel.results"]
        .as_array()
        .expect("results should be an array")
        .iter()
        .map(|entry| entry["branch_id"].clone())
        .collect();
    assert_eq!(ranked, vec![json!("c"), json!("a"), json!("b")]);
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_branch_writes_expected_isolated_until_winner_merged() {
    let fan = Node::new("fan", SHAPE_FAN_OUT);
    let graph = fan_graph(fan, &["a", "b"]);
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("plan", NodeOutcome::success().with_update("seed", json!("s1")))
            .outcome(
                "a",
                NodeOutcome::success()
                    .with_update("x", json!(1))
                    .with_update("a.only", json!(true))
                    .with_update("score", json!(0.2)),
            )
            .outcome(
                "b",
                NodeOutcome::success()
                    .with_update("x", json!(2))
                    .with_update("score", json!(0.9)),
            ),
    );

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    for branch in ["a", "b"] {
        let seen = handler.seen(branch).expect("branch should have run");
        assert_eq!(seen.get("seed"), Some(&json!("s1")));
        assert!(seen.get("x").is_none(), "branch {branch} saw a sibling write");
    }
    assert_eq!(result.context.get("x"), Some(&json!(2)));
    assert!(result.context.get("a.only").is_none());
    assert_eq!(result.context.get("parallel.fan_in.best_id"), Some(&json!("b")));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_fail_fast_expected_failure_routed_from_fan_in() {
    let fan = Node::new("fan", SHAPE_FAN_OUT).with_attr("error_policy", "fail_fast");
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("a", NodeOutcome::failure("a broke"))
            .block("b")
            .block("c"),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner(Arc::clone(&handler)).run(Arc::new(graph), RunConfig::default()),
    )
    .await
    .expect("fail_fast should not wait for blocked branches")
    .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert!(matches!(
        result.failure,
        Some(PipelineFailure::PipelineTermination { ref node_id, ref reason })
            if node_id == "join" && reason.contains("'a'")
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_ignore_expected_failures_dropped_from_results_but_counted() {
    let fan = Node::new("fan", SHAPE_FAN_OUT).with_attr("error_policy", "ignore");
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default().outcome("b", NodeOutcome::failure("no")));

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.context.get("parallel.fail_count"), Some(&json!(1)));
    let results = result.context["parallel.results"]
        .as_array()
        .expect("results should be an array");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|entry| entry["status"] == json!("success")));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_k_greater_than_branch_count_expected_unsatisfiable_failure() {
    let fan = Node::new("fan", SHAPE_FAN_OUT)
        .with_attr("join_policy", "k_of_n")
        .with_attr("k", 4);
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default());

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert_eq!(handler.ran(), set(&["plan"]));
    assert_eq!(
        result.failure,
        Some(PipelineFailure::JoinUnsatisfiable {
            node_id: "fan".to_string(),
            policy: "k_of_n".to_string(),
            succeeded: 0,
            required: 4,
        })
    );
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_first_success_expected_proceed_while_sibling_blocked() {
    let fan = Node::new("fan", SHAPE_FAN_OUT).with_attr("join_policy", "first_success");
    let graph = fan_graph(fan, &["a", "b"]);
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("a", NodeOutcome::success().with_update("a.done", json!(true)))
            .block("b"),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner(Arc::clone(&handler)).run(Arc::new(graph), RunConfig::default()),
    )
    .await
    .expect("first_success should not wait for the blocked branch")
    .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.context.get("parallel.success_count"), Some(&json!(1)));
    assert_eq!(result.context.get("parallel.fan_in.best_id"), Some(&json!("a")));
    assert_eq!(result.context.get("a.done"), Some(&json!(true)));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_quorum_met_expected_proceed_without_last_branch() {
    let fan = Node::new("fan", SHAPE_FAN_OUT)
        .with_attr("join_policy", "quorum")
        .with_attr("quorum_fraction", 0.5)
        .with_attr("error_policy", "continue");
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default().block("c"));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner(Arc::clone(&handler)).run(Arc::new(graph), RunConfig::default()),
    )
    .await
    .expect("quorum should not wait for the blocked branch")
    .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.context.get("parallel.success_count"), Some(&json!(2)));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_quorum_unmet_expected_join_unsatisfiable_failure() {
    let fan = Node::new("fan", SHAPE_FAN_OUT)
        .with_attr("join_policy", "quorum")
        .with_attr("quorum_fraction", 0.6)
        .with_attr("error_policy", "continue");
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("a", NodeOutcome::failure("a broke"))
            .outcome("b", NodeOutcome::failure("b broke"))
            .block("c"),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner(Arc::clone(&handler)).run(Arc::new(graph), RunConfig::default()),
    )
    .await
    .expect("an unreachable quorum should fail without waiting")
    .expect("run should return a result");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert_eq!(
        result.failure,
        Some(PipelineFailure::JoinUnsatisfiable {
            node_id: "fan".to_string(),
            policy: "quorum".to_string(),
            succeeded: 0,
            required: 2,
        })
    );
    assert_eq!(result.context.get("parallel.fail_count"), Some(&json!(2)));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_fail_fast_expected_sibling_stopped_and_its_writes_dropped() {
    let graph = GraphBuilder::new("fail_fast")
        .node(Node::new("start", SHAPE_START))
        .node(Node::new("fan", SHAPE_FAN_OUT).with_attr("error_policy", "fail_fast"))
        .node(Node::new("a", DEFAULT_SHAPE))
        .node(Node::new("b", DEFAULT_SHAPE))
        .node(Node::new("b2", DEFAULT_SHAPE))
        .node(Node::new("join", SHAPE_FAN_IN))
        .node(Node::new("exit", SHAPE_EXIT))
        .chain(&["start", "fan", "a", "join", "exit"])
        .edge(Edge::new("fan", "b"))
        .chain(&["b", "b2", "join"])
        .build();
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("a", NodeOutcome::failure("a broke"))
            .outcome("b", NodeOutcome::success().with_update("b.done", json!(true)))
            .slow("b", Duration::from_millis(20)),
    );

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should return a result");
    // Give the detached sibling time to finish its handler call.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(result.status, PipelineStatus::Fail);
    assert!(!handler.ran().contains("b2"), "cancelled branch took another step");
    assert!(result.context.get("b.done").is_none());
    let branches: Vec<_> = result.context["parallel.results"]
        .as_array()
        .expect("results should be an array")
        .iter()
        .map(|entry| entry["branch_id"].clone())
        .collect();
    assert_eq!(branches, vec![json!("a")]);
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_nested_expected_inner_join_before_outer_join() {
    let graph = GraphBuilder::new("nested")
        .node(Node::new("start", SHAPE_START))
        .node(Node::new("fan", SHAPE_FAN_OUT))
        .node(Node::new("a", DEFAULT_SHAPE))
        .node(Node::new("inner", SHAPE_FAN_OUT))
        .node(Node::new("x", DEFAULT_SHAPE))
        .node(Node::new("y", DEFAULT_SHAPE))
        .node(Node::new("inner_join", SHAPE_FAN_IN))
        .node(Node::new("join", SHAPE_FAN_IN))
        .node(Node::new("exit", SHAPE_EXIT))
        .chain(&["start", "fan", "a", "join", "exit"])
        .edge(Edge::new("fan", "inner"))
        .edge(Edge::new("inner", "x"))
        .edge(Edge::new("inner", "y"))
        .edge(Edge::new("x", "inner_join"))
        .edge(Edge::new("y", "inner_join"))
        .edge(Edge::new("inner_join", "join"))
        .build();
    let handler = Arc::new(BranchHandler::default());

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.ran(), set(&["a", "x", "y"]));
    assert_eq!(result.context.get("parallel.branch_count"), Some(&json!(2)));
    assert_eq!(result.context.get("parallel.success_count"), Some(&json!(2)));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_max_parallel_one_expected_branches_run_one_at_a_time() {
    let fan = Node::new("fan", SHAPE_FAN_OUT).with_attr("max_parallel", 1);
    let graph = fan_graph(fan, &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default().delay(Duration::from_millis(5)));

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.ran(), set(&["plan", "a", "b", "c"]));
    assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_max_parallel_above_branch_count_expected_all_branches_run() {
    let fan = Node::new("fan", SHAPE_FAN_OUT)
        .with_attr("max_parallel", 4_000_000_000_000_000_000_i64);
    let graph = fan_graph(fan, &["a", "b"]);
    let handler = Arc::new(BranchHandler::default());

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(handler.ran(), set(&["plan", "a", "b"]));
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_unbounded_expected_branches_overlap() {
    let graph = fan_graph(Node::new("fan", SHAPE_FAN_OUT), &["a", "b", "c"]);
    let handler = Arc::new(BranchHandler::default().delay(Duration::from_millis(5)));

    runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(handler.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn fan_out_labelled_edges_expected_labels_as_branch_ids() {
    let graph = GraphBuilder::new("labels")
        .node(Node::new("start", SHAPE_START))
        .node(Node::new("fan", SHAPE_FAN_OUT))
        .node(Node::new("a", DEFAULT_SHAPE))
        .node(Node::new("b", DEFAULT_SHAPE))
        .node(Node::new("join", SHAPE_FAN_IN))
        .node(Node::new("exit", SHAPE_EXIT))
        .chain(&["start", "fan"])
        .edge(Edge::new("fan", "a").with_label("left"))
        .edge(Edge::new("fan", "b").with_label("right"))
        .edge(Edge::new("a", "join"))
        .edge(Edge::new("b", "join"))
        .edge(Edge::new("join", "exit"))
        .build();
    let handler = Arc::new(
        BranchHandler::default()
            .outcome("b", NodeOutcome::success().with_update("score", json!(1.0))),
    );

    let result = runner(Arc::clone(&handler))
        .run(Arc::new(graph), RunConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(
        result.context.get("parallel.fan_in.best_id"),
        Some(&json!("right"))
    );
}
