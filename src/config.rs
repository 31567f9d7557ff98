use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{Priority, WorkflowState};

/// Process configuration, passed by reference to each component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: String,
    pub agent_id: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub database_url: Option<String>,
    pub api_port: Option<u16>,
    pub safety: SafetyConfig,
    pub registry: RegistryConfig,
    pub routing: RoutingWeights,
    pub workflow: WorkflowConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: "nova".to_string(),
            agent_id: "nova-local".to_string(),
            role: "generalist".to_string(),
            capabilities: vec!["developer".to_string()],
            database_url: None,
            api_port: None,
            safety: SafetyConfig::default(),
            registry: RegistryConfig::default(),
            routing: RoutingWeights::default(),
            workflow: WorkflowConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads the optional TOML file, then lets the environment override it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(system) = std::env::var("NOVA_SYSTEM") {
            self.system = system;
        }
        if let Ok(agent_id) = std::env::var("NOVA_AGENT_ID") {
            self.agent_id = agent_id;
        }
        if let Ok(role) = std::env::var("NOVA_ROLE") {
            self.role = role;
        }
        if let Ok(capabilities) = std::env::var("NOVA_CAPABILITIES") {
            self.capabilities = capabilities
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(port) = std::env::var("NOVA_API_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.api_port = Some(port);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.is_empty() || self.system.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "system name {:?} must be non-empty and contain no dots",
                self.system
            )));
        }
        if self.agent_id.is_empty() || self.agent_id.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "agent id {:?} must be non-empty and contain no dots",
                self.agent_id
            )));
        }
        if self.safety.max_requests_per_window == 0 || self.safety.rate_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate limit window and request budget must be positive".into(),
            ));
        }
        if self.safety.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_errors must be positive".into(),
            ));
        }
        if self.safety.loop_detection_threshold < 2 {
            return Err(ConfigError::Invalid(
                "loop_detection_threshold must be at least 2".into(),
            ));
        }
        if !(self.safety.caution_violations <= self.safety.warning_violations
            && self.safety.warning_violations <= self.safety.critical_violations)
        {
            return Err(ConfigError::Invalid(
                "violation thresholds must be ordered caution <= warning <= critical".into(),
            ));
        }
        if self.registry.heartbeat_interval_secs >= self.registry.heartbeat_timeout_secs {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be shorter than the heartbeat timeout".into(),
            ));
        }
        if self.workflow.coordination_check_every == 0 || self.workflow.metrics_every == 0 {
            return Err(ConfigError::Invalid(
                "periodic cycle intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_requests_per_window: u32,
    pub rate_window_secs: u64,
    pub max_concurrent_requests: u32,
    pub max_consecutive_errors: u32,
    pub loop_detection_threshold: u32,
    pub loop_history_len: usize,
    pub violation_window_secs: u64,
    pub caution_violations: u32,
    pub warning_violations: u32,
    pub critical_violations: u32,
    pub max_violation_history: usize,
    /// Entry points whose re-invocation inside an unbounded loop is dangerous.
    pub self_invocation_commands: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 25,
            rate_window_secs: 60,
            max_concurrent_requests: 5,
            max_consecutive_errors: 5,
            loop_detection_threshold: 5,
            loop_history_len: 10,
            violation_window_secs: 300,
            caution_violations: 1,
            warning_violations: 3,
            critical_violations: 5,
            max_violation_history: 100,
            self_invocation_commands: vec!["claude".to_string(), "nova".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 300,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }
}

/// Weights of the `find_best_agent` score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingWeights {
    pub capability_weight: f64,
    pub queue_weight: f64,
    pub success_weight: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            capability_weight: 10.0,
            queue_weight: 1.0,
            success_weight: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub priority_threshold: Priority,
    pub coordination_check_every: u64,
    pub metrics_every: u64,
    pub phase_task_quota: u32,
    pub task_timeout_secs: u64,
    pub broker_read_timeout_ms: u64,
    pub max_messages_per_check: usize,
    pub audit_capacity: usize,
    pub sleep: StateSleeps,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            priority_threshold: Priority::High,
            coordination_check_every: 5,
            metrics_every: 10,
            phase_task_quota: 10,
            task_timeout_secs: 300,
            broker_read_timeout_ms: 500,
            max_messages_per_check: 50,
            audit_capacity: 500,
            sleep: StateSleeps::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn broker_read_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_read_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Adaptive sleep per state, in seconds. Long pauses are deliberate backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSleeps {
    pub initializing: u64,
    pub stream_check: u64,
    pub work_discovery: u64,
    pub task_execution: u64,
    pub progress_update: u64,
    pub completion_routine: u64,
    pub phase_transition: u64,
    pub error_recovery: u64,
    pub safety_pause: u64,
}

impl Default for StateSleeps {
    fn default() -> Self {
        Self {
            initializing: 5,
            stream_check: 2,
            work_discovery: 3,
            task_execution: 10,
            progress_update: 5,
            completion_routine: 30,
            phase_transition: 180,
            error_recovery: 30,
            safety_pause: 60,
        }
    }
}

impl StateSleeps {
    /// No pauses at all; for tests and single-step tooling.
    pub fn zero() -> Self {
        Self {
            initializing: 0,
            stream_check: 0,
            work_discovery: 0,
            task_execution: 0,
            progress_update: 0,
            completion_routine: 0,
            phase_transition: 0,
            error_recovery: 0,
            safety_pause: 0,
        }
    }

    pub fn for_state(&self, state: WorkflowState) -> Duration {
        let secs = match state {
            WorkflowState::Initializing => self.initializing,
            WorkflowState::StreamCheck => self.stream_check,
            WorkflowState::WorkDiscovery => self.work_discovery,
            WorkflowState::TaskExecution => self.task_execution,
            WorkflowState::ProgressUpdate => self.progress_update,
            WorkflowState::CompletionRoutine => self.completion_routine,
            WorkflowState::PhaseTransition => self.phase_transition,
            WorkflowState::ErrorRecovery => self.error_recovery,
            WorkflowState::SafetyPause => self.safety_pause,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub block_timeout_ms: u64,
    pub batch_size: usize,
    pub error_backoff_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            block_timeout_ms: 5000,
            batch_size: 32,
            error_backoff_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_sleeps_match_state_table() {
        let sleeps = StateSleeps::default();
        assert_eq!(sleeps.for_state(WorkflowState::Initializing).as_secs(), 5);
        assert_eq!(sleeps.for_state(WorkflowState::TaskExecution).as_secs(), 10);
        assert_eq!(sleeps.for_state(WorkflowState::PhaseTransition).as_secs(), 180);
        assert_eq!(sleeps.for_state(WorkflowState::SafetyPause).as_secs(), 60);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
agent_id = "nova-7"
capabilities = ["developer", "tester"]

[safety]
max_requests_per_window = 3

[routing]
success_weight = 2.5
"#
        )
        .unwrap();

        let config: Config =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(config.agent_id, "nova-7");
        assert_eq!(config.safety.max_requests_per_window, 3);
        assert_eq!(config.safety.rate_window_secs, 60);
        assert_eq!(config.routing.success_weight, 2.5);
        assert_eq!(config.routing.capability_weight, 10.0);
        assert_eq!(config.workflow.priority_threshold, Priority::High);
    }

    #[test]
    fn test_validate_rejects_dotted_agent_id() {
        let config = Config {
            agent_id: "nova.1".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_heartbeat_longer_than_timeout() {
        let mut config = Config::default();
        config.registry.heartbeat_interval_secs = 600;
        assert!(config.validate().is_err());
    }
}
