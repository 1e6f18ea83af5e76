use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Pipeline(PipelineEvent),
    Stage(StageEvent),
    Parallel(ParallelEvent),
    GoalGate(GoalGateEvent),
    Checkpoint(CheckpointEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        run_id: String,
        graph_id: String,
    },
    Resumed {
        run_id: String,
        graph_id: String,
        checkpoint_id: String,
        next_node: Option<String>,
    },
    Paused {
        run_id: String,
        graph_id: String,
        node_id: String,
    },
    Completed {
        run_id: String,
        graph_id: String,
    },
    Failed {
        run_id: String,
        graph_id: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEvent {
    Started {
        run_id: String,
        node_id: String,
        branch_id: Option<String>,
        stage_attempt_id: String,
    },
    Completed {
        run_id: String,
        node_id: String,
        branch_id: Option<String>,
        stage_attempt_id: String,
        status: String,
        attempts: u32,
        notes: Option<String>,
    },
    Failed {
        run_id: String,
        node_id: String,
        branch_id: Option<String>,
        stage_attempt_id: String,
        attempts: u32,
        reason: Option<String>,
    },
    Retrying {
        run_id: String,
        node_id: String,
        branch_id: Option<String>,
        stage_attempt_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParallelEvent {
    Started {
        run_id: String,
        node_id: String,
        fan_in_node: String,
        branch_count: usize,
        join_policy: String,
        error_policy: String,
    },
    BranchStarted {
        run_id: String,
        node_id: String,
        branch_id: String,
        branch_index: usize,
        target_node: String,
    },
    BranchCompleted {
        run_id: String,
        node_id: String,
        branch_id: String,
        branch_index: usize,
        status: String,
        cancelled: bool,
        duration_ms: u64,
    },
    Completed {
        run_id: String,
        node_id: String,
        phase: String,
        success_count: usize,
        failure_count: usize,
        best_branch: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoalGateEvent {
    Rerouted {
        run_id: String,
        unsatisfied: Vec<String>,
        target: String,
        reroute_count: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Saved {
        run_id: String,
        node_id: String,
        checkpoint_id: String,
        sequence_no: u64,
    },
}

/// Synchronous callback invoked for every event, on the emitting task.
pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event)
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone)]
enum Delivery {
    Callback(SharedRuntimeEventObserver),
    Channel(RuntimeEventSender),
}

/// Fan-out point for runtime events. An empty sink drops everything and
/// lets the engine skip building events at all.
#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    targets: Vec<Delivery>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self::default().observer(observer)
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self::default().sender(sender)
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.targets.push(Delivery::Callback(observer));
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.targets.push(Delivery::Channel(sender));
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Delivers to callbacks first, in registration order. Closed channels
    /// are skipped without error.
    pub fn emit(&self, event: RuntimeEvent) {
        for target in &self.targets {
            match target {
                Delivery::Callback(observer) => observer.on_event(&event),
                Delivery::Channel(sender) if !sender.is_closed() => {
                    if sender.send(event.clone()).is_err() {
                        tracing::trace!(sequence_no = event.sequence_no, "event receiver dropped");
                    }
                }
                Delivery::Channel(_) => {}
            }
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

/// Stamps events with a run-wide sequence number. Clones share the counter,
/// so parallel branches interleave into one ordered stream.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    sink: RuntimeEventSink,
    sequence_no: Arc<AtomicU64>,
}

impl EventEmitter {
    pub(crate) fn new(sink: RuntimeEventSink) -> Self {
        Self {
            sink,
            sequence_no: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn emit(&self, kind: RuntimeEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        let sequence_no = self.sequence_no.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(RuntimeEvent {
            sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }
}

/// Unix time with millisecond precision, rendered as `<secs>.<millis>Z`.
pub(crate) fn timestamp_now() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    format!("{}.{:03}Z", millis / 1000, millis % 1000)
}
