use crate::{
    Context, EngineConfig, EngineError, Graph, JitterRange, Node, NodeHandler, NodeOutcome,
    NodeStatus,
};
use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffPreset::Standard.config()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffPreset {
    Conservative,
    Standard,
    Aggressive,
    Linear,
    None,
}

impl BackoffPreset {
    pub const ALL: [BackoffPreset; 5] = [
        Self::Conservative,
        Self::Standard,
        Self::Aggressive,
        Self::Linear,
        Self::None,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str().eq_ignore_ascii_case(name.trim()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Standard => "standard",
            Self::Aggressive => "aggressive",
            Self::Linear => "linear",
            Self::None => "none",
        }
    }

    pub fn config(self) -> BackoffConfig {
        let (initial_delay_ms, backoff_factor, max_delay_ms, jitter) = match self {
            Self::Conservative => (2_000, 3.0, 60_000, true),
            Self::Standard => (200, 2.0, 60_000, true),
            Self::Aggressive => (50, 1.5, 5_000, true),
            Self::Linear => (500, 1.0, 500, false),
            Self::None => (0, 1.0, 0, false),
        };
        BackoffConfig {
            initial_delay_ms,
            backoff_factor,
            max_delay_ms,
            jitter,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub jitter: JitterRange,
    pub allow_partial: bool,
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPreset::None.config(),
            jitter: JitterRange::default(),
            allow_partial: false,
        }
    }
}

/// `max_retries` defaults to 0 and is capped by the graph's retry ceiling.
/// The backoff preset resolves node `backoff_policy`, then graph
/// `default_backoff_policy`, then the engine default.
pub fn build_retry_policy(node: &Node, graph: &Graph, config: &EngineConfig) -> RetryPolicy {
    let ceiling = config.retry_ceiling(graph);
    let max_retries = node
        .attrs
        .get_i64("max_retries")
        .unwrap_or(0)
        .clamp(0, i64::from(ceiling)) as u32;

    let backoff = node
        .attrs
        .get_str("backoff_policy")
        .or_else(|| graph.attrs().get_str("default_backoff_policy"))
        .and_then(|name| config.backoff_config(name))
        .or_else(|| config.backoff_config(&config.default_backoff_policy))
        .unwrap_or_default();

    RetryPolicy {
        max_attempts: max_retries.saturating_add(1),
        backoff,
        jitter: config.jitter,
        allow_partial: node.attrs.get_bool("allow_partial").unwrap_or(false),
    }
}

pub fn should_retry_outcome(outcome: &NodeOutcome) -> bool {
    matches!(outcome.status, NodeStatus::Retry | NodeStatus::Fail)
}

pub fn finalize_retry_exhausted(last: NodeOutcome, policy: &RetryPolicy) -> NodeOutcome {
    if policy.allow_partial {
        return NodeOutcome {
            status: NodeStatus::PartialSuccess,
            notes: Some("retries exhausted, partial accepted".to_string()),
            ..last
        };
    }

    match last.status {
        NodeStatus::Retry => NodeOutcome {
            status: NodeStatus::Fail,
            failure_reason: Some(
                last.failure_reason
                    .clone()
                    .unwrap_or_else(|| "max retries exceeded".to_string()),
            ),
            ..last
        },
        _ => last,
    }
}

/// Delay before the attempt after `attempt`, without jitter.
pub fn base_delay_ms(attempt: u32, backoff: &BackoffConfig) -> f64 {
    let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base = (backoff.initial_delay_ms as f64) * backoff.backoff_factor.powi(exp);
    base.min(backoff.max_delay_ms as f64).max(0.0)
}

pub fn delay_for_attempt<R: Rng + ?Sized>(
    attempt: u32,
    backoff: &BackoffConfig,
    jitter: JitterRange,
    rng: &mut R,
) -> Duration {
    let mut delay = base_delay_ms(attempt, backoff);
    if backoff.jitter && delay > 0.0 {
        let factor = if jitter.max > jitter.min {
            rng.gen_range(jitter.min..=jitter.max)
        } else {
            jitter.min
        };
        delay *= factor;
    }
    Duration::from_millis(delay.round().max(0.0) as u64)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrySignal {
    pub node_id: String,
    /// The attempt that just failed, 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub status: NodeStatus,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait RetryListener: Send + Sync {
    async fn on_retry(&self, signal: &RetrySignal) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
pub struct NoopRetryListener;

#[async_trait]
impl RetryListener for NoopRetryListener {
    async fn on_retry(&self, _signal: &RetrySignal) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryExecution {
    pub outcome: NodeOutcome,
    pub attempts: u32,
}

impl RetryExecution {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs `handler` until it stops asking for a retry or attempts run out.
/// Handler errors count as failed attempts. Only listener errors (storage)
/// are returned as `Err`.
pub async fn execute_with_retry(
    node: &Node,
    handler: &dyn NodeHandler,
    context: &Context,
    graph: &Graph,
    policy: &RetryPolicy,
    rng: &mut StdRng,
    listener: &dyn RetryListener,
) -> Result<RetryExecution, EngineError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match handler.handle(node, context, graph).await {
            Ok(outcome) => outcome,
            Err(error) => NodeOutcome::failure(error.to_string()),
        };

        if !should_retry_outcome(&outcome) {
            return Ok(RetryExecution {
                outcome,
                attempts: attempt,
            });
        }
        if attempt >= max_attempts {
            return Ok(RetryExecution {
                outcome: finalize_retry_exhausted(outcome, policy),
                attempts: attempt,
            });
        }

        let delay = delay_for_attempt(attempt, &policy.backoff, policy.jitter, rng);
        tracing::warn!(
            node_id = %node.id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            reason = outcome.failure_reason.as_deref().unwrap_or(""),
            "stage attempt failed, retrying"
        );
        listener
            .on_retry(&RetrySignal {
                node_id: node.id.clone(),
                attempt,
                max_attempts,
                delay,
                status: outcome.status,
                failure_reason: outcome.failure_reason.clone(),
            })
            .await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}
