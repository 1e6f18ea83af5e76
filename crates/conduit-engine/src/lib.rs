//! Conduit pipeline execution engine.
//!
//! Runs directed graphs of nodes: each node is dispatched by shape to a
//! [`NodeHandler`], its outcome drives edge selection, retries, failure
//! routing and goal-gate checks, and fan-out nodes run their branches
//! concurrently. Progress is checkpointed into a `conduit-turnstore` so a
//! paused run can resume without re-executing finished nodes.

pub mod cancel;
pub mod checkpoint;
pub mod condition;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod failure;
pub mod goal_gate;
pub mod graph;
pub mod handlers;
pub mod parallel;
pub mod resume;
pub mod retry;
pub mod routing;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod validation;

pub use cancel::CancellationToken;
pub use checkpoint::*;
pub use condition::*;
pub use config::*;
pub use context::*;
pub use diagnostics::*;
pub use errors::*;
pub use events::*;
pub use failure::*;
pub use goal_gate::*;
pub use graph::*;
pub use handlers::passthrough::PassthroughHandler;
pub use handlers::registry::HandlerRegistry;
pub use handlers::{NodeHandler, SharedNodeHandler};
pub use parallel::{
    BRANCH_SCORE_KEY, BranchResult, ErrorPolicy, JoinPolicy, ParallelPhase, ParallelReport,
    ParallelSettings,
};
pub use resume::*;
pub use retry::*;
pub use routing::*;
pub use runner::{PipelineRunner, resume_config};
pub use runtime::*;
pub use state::*;
pub use storage::{
    CheckpointRecord, PipelineCorrelation, PipelineStorageWriter, RetryingRecord, RunEventRecord,
    SharedPipelineStorageWriter, StageEventRecord,
};
pub use validation::*;
