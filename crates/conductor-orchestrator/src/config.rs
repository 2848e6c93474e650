use crate::types::AgentProfile;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Policy applied when a step exhausts its local retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Re-run the whole plan, unmodified, after a fixed delay.
    #[default]
    #[serde(alias = "fallback")]
    Retry,
    /// Re-bind failed steps to the next-best agent and re-run.
    Redistribute,
    /// Clone the plan under a fresh id, re-bind every step, run the clone.
    Failover,
}

impl std::fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMode::Retry => write!(f, "retry"),
            RecoveryMode::Redistribute => write!(f, "redistribute"),
            RecoveryMode::Failover => write!(f, "failover"),
        }
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Plans allowed to run at the same time. Also caps the compiler's candidate set.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Total dispatch attempts per step before it is marked failed.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Cap for exponential backoff.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Per-dispatch timeout.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default)]
    pub recovery_mode: RecoveryMode,
    /// Fixed delay before a `retry` recovery re-runs the plan.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    /// Recovery rounds allowed per execution, including rounds on regenerated plans.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_max_concurrent_agents() -> usize {
    5
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_step_timeout_ms() -> u64 {
    30_000
}
fn default_recovery_delay_ms() -> u64 {
    2_000
}
fn default_max_recovery_attempts() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            recovery_mode: RecoveryMode::default(),
            recovery_delay_ms: default_recovery_delay_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl EngineConfig {
    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    ///
    /// `base × 2^(attempt-1)`, capped at `retry_max_delay_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrent_agents == 0 {
            return Err(ConductorError::Config(
                "engine.max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConductorError::Config(
                "engine.retry_attempts must be at least 1".into(),
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(ConductorError::Config(
                "engine.step_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Orchestration manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Tasks at or above this priority bypass the queue when a slot is free.
    #[serde(default = "default_high_priority_threshold")]
    pub high_priority_threshold: i32,
    /// Execution history entries kept for metrics.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Period of the background loop that drains the queue and self-tunes.
    #[serde(default = "default_tuning_interval_ms")]
    pub tuning_interval_ms: u64,
    #[serde(default = "default_tuning_enabled")]
    pub tuning_enabled: bool,
    /// History entries required before tuning acts.
    #[serde(default = "default_tuning_min_samples")]
    pub tuning_min_samples: usize,
    #[serde(default = "default_low_success_threshold")]
    pub low_success_threshold: f64,
    #[serde(default = "default_high_success_threshold")]
    pub high_success_threshold: f64,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_high_priority_threshold() -> i32 {
    8
}
fn default_history_limit() -> usize {
    1_000
}
fn default_tuning_interval_ms() -> u64 {
    30_000
}
fn default_tuning_enabled() -> bool {
    true
}
fn default_tuning_min_samples() -> usize {
    10
}
fn default_low_success_threshold() -> f64 {
    0.7
}
fn default_high_success_threshold() -> f64 {
    0.95
}
fn default_min_concurrency() -> usize {
    1
}
fn default_max_concurrency() -> usize {
    20
}
fn default_event_capacity() -> usize {
    256
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            high_priority_threshold: default_high_priority_threshold(),
            history_limit: default_history_limit(),
            tuning_interval_ms: default_tuning_interval_ms(),
            tuning_enabled: default_tuning_enabled(),
            tuning_min_samples: default_tuning_min_samples(),
            low_success_threshold: default_low_success_threshold(),
            high_success_threshold: default_high_success_threshold(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ManagerConfig {
    pub fn tuning_interval(&self) -> Duration {
        Duration::from_millis(self.tuning_interval_ms)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.history_limit == 0 {
            return Err(ConductorError::Config(
                "manager.history_limit must be at least 1".into(),
            ));
        }
        if self.min_concurrency == 0 || self.min_concurrency > self.max_concurrency {
            return Err(ConductorError::Config(format!(
                "manager concurrency bounds are invalid: min {} max {}",
                self.min_concurrency, self.max_concurrency
            )));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.low_success_threshold)
            || !in_unit(self.high_success_threshold)
            || self.low_success_threshold > self.high_success_threshold
        {
            return Err(ConductorError::Config(format!(
                "manager success thresholds are invalid: low {} high {}",
                self.low_success_threshold, self.high_success_threshold
            )));
        }
        if self.tuning_interval_ms == 0 {
            return Err(ConductorError::Config(
                "manager.tuning_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level orchestrator configuration, usually read from `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

impl OrchestratorConfig {
    pub fn from_toml_str(source: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| ConductorError::Config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        self.engine.validate()?;
        self.manager.validate()?;
        for agent in &self.agents {
            crate::registry::validate_profile(agent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_agents, 5);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.recovery_mode, RecoveryMode::Retry);
        assert_eq!(config.max_recovery_attempts, 1);
        assert_eq!(ManagerConfig::default().high_priority_threshold, 8);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig {
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            ..EngineConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(500));
        assert_eq!(config.backoff_for(2), Duration::from_millis(1_000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(2_000));
        assert_eq!(config.backoff_for(7), Duration::from_millis(30_000));
        assert_eq!(config.backoff_for(64), Duration::from_millis(30_000));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [engine]
            recovery_mode = "redistribute"
            retry_attempts = 2

            [[agents]]
            id = "reporter"
            name = "Reporter"
            skills = ["reporting"]
            priority = 5
            confidence = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.recovery_mode, RecoveryMode::Redistribute);
        assert_eq!(config.engine.retry_attempts, 2);
        assert_eq!(config.engine.step_timeout_ms, 30_000);
        assert_eq!(config.manager.history_limit, 1_000);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].max_concurrent_tasks, 1);
        assert!(config.agents[0].skills.contains("reporting"));
    }

    #[test]
    fn test_fallback_alias() {
        let config = OrchestratorConfig::from_toml_str("[engine]\nrecovery_mode = \"fallback\"\n")
            .unwrap();
        assert_eq!(config.engine.recovery_mode, RecoveryMode::Retry);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = OrchestratorConfig::from_toml_str("[engine]\nretry_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("retry_attempts"));

        let err = OrchestratorConfig::from_toml_str(
            "[manager]\nlow_success_threshold = 0.9\nhigh_success_threshold = 0.5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("thresholds"));

        let err = OrchestratorConfig::from_toml_str(
            "[[agents]]\nid = \"a\"\nname = \"A\"\nconfidence = 1.5\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        tokio::fs::write(&path, "[manager]\nhigh_priority_threshold = 5\n")
            .await
            .unwrap();
        let config = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(config.manager.high_priority_threshold, 5);

        let missing = OrchestratorConfig::load(dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(ConductorError::Config(_))));
    }
}
