pub mod agent;
pub mod message;
pub mod safety;
pub mod task;
pub mod workflow;

pub use agent::{AgentInfo, PerformanceCounters};
pub use message::{ControlCommand, CoordinationMessage, EcosystemEvent, EventType, MessageType};
pub use safety::SafetyViolation;
pub use task::{TaskOutcome, TaskRecord, TaskSpec};
pub use workflow::{WorkflowCycle, WorkflowSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type AgentId = String;
pub type TaskId = String;
pub type SessionId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Initializing,
    StreamCheck,
    WorkDiscovery,
    TaskExecution,
    ProgressUpdate,
    CompletionRoutine,
    PhaseTransition,
    ErrorRecovery,
    SafetyPause,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 9] = [
        WorkflowState::Initializing,
        WorkflowState::StreamCheck,
        WorkflowState::WorkDiscovery,
        WorkflowState::TaskExecution,
        WorkflowState::ProgressUpdate,
        WorkflowState::CompletionRoutine,
        WorkflowState::PhaseTransition,
        WorkflowState::ErrorRecovery,
        WorkflowState::SafetyPause,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            WorkflowState::Initializing => "INITIALIZING",
            WorkflowState::StreamCheck => "STREAM_CHECK",
            WorkflowState::WorkDiscovery => "WORK_DISCOVERY",
            WorkflowState::TaskExecution => "TASK_EXECUTION",
            WorkflowState::ProgressUpdate => "PROGRESS_UPDATE",
            WorkflowState::CompletionRoutine => "COMPLETION_ROUTINE",
            WorkflowState::PhaseTransition => "PHASE_TRANSITION",
            WorkflowState::ErrorRecovery => "ERROR_RECOVERY",
            WorkflowState::SafetyPause => "SAFETY_PAUSE",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
    Critical,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &str {
        match self {
            SafetyLevel::Normal => "NORMAL",
            SafetyLevel::Caution => "CAUTION",
            SafetyLevel::Warning => "WARNING",
            SafetyLevel::Critical => "CRITICAL",
        }
    }

    /// WARNING and above stop every cycle that would act externally.
    pub fn blocks_progress(&self) -> bool {
        *self >= SafetyLevel::Warning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    RateLimit,
    ErrorBurst,
    LoopDetected,
    DangerousContent,
    CriticalError,
}

impl ViolationKind {
    pub fn as_str(&self) -> &str {
        match self {
            ViolationKind::RateLimit => "RATE_LIMIT",
            ViolationKind::ErrorBurst => "ERROR_BURST",
            ViolationKind::LoopDetected => "LOOP_DETECTED",
            ViolationKind::DangerousContent => "DANGEROUS_CONTENT",
            ViolationKind::CriticalError => "CRITICAL_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Busy,
    Idle,
    Inactive,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Busy => "busy",
            AgentStatus::Idle => "idle",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Offline => "offline",
        }
    }

    /// Statuses an agent reports for itself while alive.
    pub fn is_live_status(&self) -> bool {
        matches!(
            self,
            AgentStatus::Active | AgentStatus::Busy | AgentStatus::Idle
        )
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "busy" => Ok(AgentStatus::Busy),
            "idle" => Ok(AgentStatus::Idle),
            "inactive" => Ok(AgentStatus::Inactive),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Manual,
    #[default]
    Auto,
    Training,
}

impl OperatingMode {
    pub fn as_str(&self) -> &str {
        match self {
            OperatingMode::Manual => "manual",
            OperatingMode::Auto => "auto",
            OperatingMode::Training => "training",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "medium" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" | "urgent" => Ok(Priority::Critical),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(Priority::from_rank)
                .ok_or_else(|| format!("unknown priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_level_ordering() {
        assert!(SafetyLevel::Normal < SafetyLevel::Caution);
        assert!(SafetyLevel::Caution < SafetyLevel::Warning);
        assert!(!SafetyLevel::Caution.blocks_progress());
        assert!(SafetyLevel::Warning.blocks_progress());
        assert!(SafetyLevel::Critical.blocks_progress());
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("3".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("9".parse::<Priority>().is_err());
        assert!(Priority::Critical > Priority::High);
    }

    #[test]
    fn test_agent_status_round_trip_names() {
        for status in [
            AgentStatus::Active,
            AgentStatus::Busy,
            AgentStatus::Idle,
            AgentStatus::Inactive,
            AgentStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
        }
        assert!(!AgentStatus::Inactive.is_live_status());
    }

    #[test]
    fn test_workflow_state_serializes_screaming_case() {
        let json = serde_json::to_string(&WorkflowState::SafetyPause).unwrap();
        assert_eq!(json, "\"SAFETY_PAUSE\"");
    }
}
