use crate::{BackoffConfig, BackoffPreset, EngineError, Graph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_MAX_RETRY: u32 = 50;

/// Uniform range the jitter multiplier is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min: f64,
    pub max: f64,
}

impl Default for JitterRange {
    fn default() -> Self {
        Self { min: 0.5, max: 1.5 }
    }
}

/// Immutable engine-wide settings, handed to the runner once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry and reroute ceiling when the graph has no `default_max_retry`.
    pub default_max_retry: u32,
    /// Overrides the reroute ceiling for every graph.
    pub reroute_limit: Option<u32>,
    pub default_backoff_policy: String,
    pub jitter: JitterRange,
    /// Fixed seed for the jitter RNG. Unset means entropy.
    pub jitter_seed: Option<u64>,
    pub default_max_parallel: Option<usize>,
    /// Named backoff presets; entries here win over the built-in ones.
    pub backoff_presets: BTreeMap<String, BackoffConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retry: DEFAULT_MAX_RETRY,
            reroute_limit: None,
            default_backoff_policy: BackoffPreset::Standard.as_str().to_string(),
            jitter: JitterRange::default(),
            jitter_seed: None,
            default_max_parallel: None,
            backoff_presets: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(input)
            .map_err(|error| EngineError::Config(format!("invalid engine config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            EngineError::Config(format!(
                "failed to read engine config '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let JitterRange { min, max } = self.jitter;
        if !min.is_finite() || !max.is_finite() || min < 0.0 || min > max {
            return Err(EngineError::Config(format!(
                "jitter range [{min}, {max}] must be finite, non-negative and ordered"
            )));
        }
        if self.default_max_parallel == Some(0) {
            return Err(EngineError::Config(
                "default_max_parallel must be at least 1".to_string(),
            ));
        }
        if self.backoff_config(&self.default_backoff_policy).is_none() {
            return Err(EngineError::Config(format!(
                "default_backoff_policy '{}' is not a known preset",
                self.default_backoff_policy
            )));
        }
        for (name, backoff) in &self.backoff_presets {
            if backoff.backoff_factor < 1.0 || !backoff.backoff_factor.is_finite() {
                return Err(EngineError::Config(format!(
                    "backoff preset '{name}' needs a finite backoff_factor >= 1"
                )));
            }
        }
        Ok(())
    }

    /// Resolves a preset by name: configured presets first, then built-ins.
    pub fn backoff_config(&self, name: &str) -> Option<BackoffConfig> {
        let name = name.trim();
        self.backoff_presets
            .get(name)
            .cloned()
            .or_else(|| BackoffPreset::from_name(name).map(BackoffPreset::config))
    }

    /// Upper bound on per-node retries for `graph`.
    pub fn retry_ceiling(&self, graph: &Graph) -> u32 {
        graph
            .attrs()
            .get_i64("default_max_retry")
            .map(|value| value.clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or(self.default_max_retry)
    }

    /// Maximum goal-gate and retry-target reroutes per run.
    pub fn reroute_limit(&self, graph: &Graph) -> u32 {
        self.reroute_limit
            .unwrap_or_else(|| self.retry_ceiling(graph))
    }
}
