use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, OperatingMode, WorkflowState};

/// One executed cycle in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCycle {
    pub cycle: u64,
    pub entry_state: WorkflowState,
    pub exit_state: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub agent_id: AgentId,
    pub state: WorkflowState,
    pub mode: OperatingMode,
    pub cycle_count: u64,
    pub tasks_completed_in_phase: u32,
    pub last_cycle: Option<WorkflowCycle>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn initial(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: WorkflowState::Initializing,
            mode: OperatingMode::default(),
            cycle_count: 0,
            tasks_completed_in_phase: 0,
            last_cycle: None,
            updated_at: Utc::now(),
        }
    }
}
