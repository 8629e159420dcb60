//! Effective-timeout resolution: default, per-model override, hard ceiling.
//!
//! Each request resolves one effective communication timeout. A base default
//! applies to models without an override; the per-model table lets fast and
//! slow backends carry different budgets; the hard ceiling caps everything,
//! overrides included.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout budgets for one request (TOML-configurable).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Base communication timeout for models without an override.
    pub default_secs: u64,

    /// Hard ceiling; no resolved timeout may exceed this.
    pub max_secs: u64,

    /// Budget for process creation itself, before any communication.
    pub connect_secs: u64,

    /// Wait after a graceful termination request before force-killing.
    pub grace_secs: u64,

    /// Per-model overrides, keyed by model identifier.
    pub per_model: BTreeMap<String, u64>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        let mut per_model = BTreeMap::new();
        per_model.insert("glm-4.5-air".to_string(), 120);
        per_model.insert("glm-4.6".to_string(), 600);
        Self {
            default_secs: 300,
            max_secs: 600,
            connect_secs: 10,
            grace_secs: 5,
            per_model,
        }
    }
}

impl TimeoutPolicy {
    /// Resolve the effective communication timeout for `model`.
    pub fn effective(&self, model: &str) -> Duration {
        let secs = self
            .per_model
            .get(model)
            .copied()
            .unwrap_or(self.default_secs)
            .min(self.max_secs);
        Duration::from_secs(secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Field errors as messages; empty when the policy is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.default_secs == 0 {
            errors.push("timeouts.default_secs must be > 0".to_string());
        }
        if self.max_secs == 0 {
            errors.push("timeouts.max_secs must be > 0".to_string());
        }
        if self.connect_secs == 0 {
            errors.push("timeouts.connect_secs must be > 0".to_string());
        }
        for (model, secs) in &self.per_model {
            if *secs == 0 {
                errors.push(format!("timeouts.per_model.{model} must be > 0"));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(default_secs: u64, max_secs: u64, table: &[(&str, u64)]) -> TimeoutPolicy {
        TimeoutPolicy {
            default_secs,
            max_secs,
            per_model: table
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            ..TimeoutPolicy::default()
        }
    }

    #[test]
    fn override_table_wins_over_default() {
        let policy = policy(300, 600, &[("fast", 120), ("full", 600)]);
        assert_eq!(policy.effective("fast"), Duration::from_secs(120));
        assert_eq!(policy.effective("full"), Duration::from_secs(600));
    }

    #[test]
    fn unlisted_model_uses_default_capped_by_ceiling() {
        let base = policy(300, 600, &[("fast", 120), ("full", 600)]);
        assert_eq!(base.effective("other"), Duration::from_secs(300));

        let capped = policy(900, 600, &[]);
        assert_eq!(capped.effective("other"), Duration::from_secs(600));
    }

    #[test]
    fn ceiling_caps_overrides_too() {
        let policy = policy(300, 600, &[("slow", 1800)]);
        assert_eq!(policy.effective("slow"), Duration::from_secs(600));
    }

    #[test]
    fn default_policy_covers_both_models() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.effective("glm-4.5-air"), Duration::from_secs(120));
        assert_eq!(policy.effective("glm-4.6"), Duration::from_secs(600));
        assert!(policy.problems().is_empty());
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let mut policy = TimeoutPolicy::default();
        policy.default_secs = 0;
        policy.per_model.insert("fast".to_string(), 0);
        let problems = policy.problems();
        assert!(problems.iter().any(|p| p.contains("default_secs")));
        assert!(problems.iter().any(|p| p.contains("per_model.fast")));
    }
}
