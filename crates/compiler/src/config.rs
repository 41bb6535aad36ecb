//! Planner configuration.

use kernelplan_autotune::DEFAULT_UNROLL_FACTORS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const REGISTRY_ENV: &str = "KERNELPLAN_REGISTRY";
pub const MODEL_ENV: &str = "KERNELPLAN_MODEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Backing file of the plan registry; in-memory when unset.
    pub registry_path: Option<PathBuf>,
    /// Cost model name, see `kernelplan_optimizer::COST_MODELS`.
    pub model: String,
    /// Replacement approximation table.
    pub table_path: Option<PathBuf>,
    pub warmup_runs: usize,
    pub runs: usize,
    /// Wall-clock budget for search and rebuild.
    pub budget: Option<Duration>,
    pub unroll_factors: Vec<u64>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            model: "analytical".into(),
            table_path: None,
            warmup_runs: 1,
            runs: 5,
            budget: None,
            unroll_factors: DEFAULT_UNROLL_FACTORS.to_vec(),
        }
    }
}

impl PlannerConfig {
    /// Defaults overridden by `KERNELPLAN_REGISTRY` and `KERNELPLAN_MODEL`.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(REGISTRY_ENV).filter(|v| !v.is_empty()) {
            self.registry_path = Some(PathBuf::from(path));
        }
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.is_empty()) {
            self.model = model;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let config = PlannerConfig::default().with_env(|key| match key {
            REGISTRY_ENV => Some("/tmp/plans.json".into()),
            MODEL_ENV => Some("bandwidth".into()),
            _ => None,
        });
        assert_eq!(config.registry_path, Some(PathBuf::from("/tmp/plans.json")));
        assert_eq!(config.model, "bandwidth");
        assert_eq!(config.runs, 5);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let config = PlannerConfig::default().with_env(|_| Some(String::new()));
        assert_eq!(config, PlannerConfig::default());
    }
}
