use crate::{EngineConfig, Node, NodeStatus};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUORUM_FRACTION: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum JoinPolicy {
    WaitAll,
    FirstSuccess,
    KOfN { k: usize },
    Quorum { fraction: f64 },
}

impl JoinPolicy {
    pub const NAMES: [&'static str; 4] = ["wait_all", "first_success", "k_of_n", "quorum"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::FirstSuccess => "first_success",
            Self::KOfN { .. } => "k_of_n",
            Self::Quorum { .. } => "quorum",
        }
    }

    /// Reads `join_policy`, `k` and `quorum_fraction` from a fan-out node.
    pub fn from_node(node: &Node) -> Result<Self, String> {
        let name = node.attrs.get_str("join_policy").unwrap_or("wait_all");
        match name.to_ascii_lowercase().as_str() {
            "wait_all" => Ok(Self::WaitAll),
            "first_success" => Ok(Self::FirstSuccess),
            "k_of_n" => {
                let k = node
                    .attrs
                    .get_i64("k")
                    .ok_or_else(|| "join_policy k_of_n requires an integer 'k'".to_string())?;
                if k < 1 {
                    return Err(format!("k must be at least 1, got {k}"));
                }
                Ok(Self::KOfN { k: k as usize })
            }
            "quorum" => {
                let fraction = node
                    .attrs
                    .get_f64("quorum_fraction")
                    .unwrap_or(DEFAULT_QUORUM_FRACTION);
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(format!("quorum_fraction must be in (0, 1], got {fraction}"));
                }
                Ok(Self::Quorum { fraction })
            }
            other => Err(format!(
                "unknown join_policy '{other}' (expected one of {})",
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Successes needed out of `total` branches. `None` waits for all.
    pub fn required_successes(self, total: usize) -> Option<usize> {
        match self {
            Self::WaitAll => None,
            Self::FirstSuccess => Some(1),
            Self::KOfN { k } => Some(k),
            Self::Quorum { fraction } => Some(((fraction * total as f64).ceil() as usize).max(1)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    FailFast,
    Continue,
    Ignore,
}

impl ErrorPolicy {
    pub const NAMES: [&'static str; 3] = ["fail_fast", "continue", "ignore"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
            Self::Ignore => "ignore",
        }
    }

    pub fn from_node(node: &Node) -> Result<Self, String> {
        let name = node.attrs.get_str("error_policy").unwrap_or("fail_fast");
        match name.to_ascii_lowercase().as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!(
                "unknown error_policy '{other}' (expected one of {})",
                Self::NAMES.join(", ")
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallelSettings {
    pub join_policy: JoinPolicy,
    pub error_policy: ErrorPolicy,
    /// `None` runs every branch at once.
    pub max_parallel: Option<usize>,
}

impl ParallelSettings {
    pub fn from_node(node: &Node, config: &EngineConfig) -> Result<Self, String> {
        let max_parallel = match node.attrs.get_i64("max_parallel") {
            Some(value) if value < 1 => {
                return Err(format!("max_parallel must be at least 1, got {value}"));
            }
            Some(value) => Some(value as usize),
            None => config.default_max_parallel,
        };
        Ok(Self {
            join_policy: JoinPolicy::from_node(node)?,
            error_policy: ErrorPolicy::from_node(node)?,
            max_parallel,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinDecision {
    Pending,
    Proceed,
    FailFast { reason: String },
    Unsatisfiable {
        reason: String,
        succeeded: usize,
        required: usize,
    },
}

impl JoinDecision {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Counts branch completions against the join and error policies.
#[derive(Clone, Debug)]
pub struct JoinTracker {
    settings: ParallelSettings,
    total: usize,
    succeeded: usize,
    failed: usize,
}

impl JoinTracker {
    pub fn new(settings: ParallelSettings, total: usize) -> Self {
        Self {
            settings,
            total,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Decision before any branch has finished; catches K > N up front.
    pub fn initial(&self) -> JoinDecision {
        self.evaluate()
    }

    pub fn record(&mut self, status: NodeStatus, branch_id: &str) -> JoinDecision {
        if status.is_success_like() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            if self.settings.error_policy == ErrorPolicy::FailFast {
                return JoinDecision::FailFast {
                    reason: format!("branch '{branch_id}' failed under fail_fast"),
                };
            }
        }
        self.evaluate()
    }

    fn evaluate(&self) -> JoinDecision {
        let remaining = self.total - self.completed();
        match self.settings.join_policy.required_successes(self.total) {
            None if remaining == 0 => JoinDecision::Proceed,
            None => JoinDecision::Pending,
            Some(required) if self.succeeded >= required => JoinDecision::Proceed,
            Some(required) if self.succeeded + remaining < required => {
                JoinDecision::Unsatisfiable {
                    reason: format!(
                        "join {} needs {required} successes but only {} of {} branches can still succeed",
                        self.settings.join_policy.as_str(),
                        self.succeeded + remaining,
                        self.total
                    ),
                    succeeded: self.succeeded,
                    required,
                }
            }
            Some(_) => JoinDecision::Pending,
        }
    }
}
