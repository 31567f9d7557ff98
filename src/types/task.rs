use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, OperatingMode, Priority, TaskId};
use crate::broker::Fields;
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub source_entry: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            required_capabilities: Vec::new(),
            dependencies: Vec::new(),
            command: None,
            source_entry: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// The routing key: the first required capability, if any.
    pub fn task_kind(&self) -> Option<&str> {
        self.required_capabilities.first().map(String::as_str)
    }

    /// Summary used for loop detection: identical commands look identical.
    pub fn fingerprint(&self) -> String {
        match &self.command {
            Some(command) => command.split_whitespace().collect::<Vec<_>>().join(" "),
            None => self.title.trim().to_lowercase(),
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("task_id".into(), self.id.clone());
        fields.insert(
            "task".into(),
            serde_json::to_string(self).unwrap_or_default(),
        );
        fields
    }

    pub fn from_fields(stream: &str, id: u64, fields: &Fields) -> Result<Self, BrokerError> {
        let raw = fields
            .get("task")
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing field task"))?;
        serde_json::from_str(raw).map_err(|e| BrokerError::malformed(stream, id, e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { output: String },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }
}

/// Completed-task audit entry appended to the agent's history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    pub mode: OperatingMode,
    pub completed_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        task: &TaskSpec,
        agent_id: impl Into<AgentId>,
        outcome: TaskOutcome,
        duration_ms: u64,
        mode: OperatingMode,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: agent_id.into(),
            outcome,
            duration_ms,
            mode,
            completed_at: Utc::now(),
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("task_id".into(), self.task_id.clone());
        fields.insert(
            "record".into(),
            serde_json::to_string(self).unwrap_or_default(),
        );
        fields
    }

    pub fn from_fields(stream: &str, id: u64, fields: &Fields) -> Result<Self, BrokerError> {
        let raw = fields
            .get("record")
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing field record"))?;
        serde_json::from_str(raw).map_err(|e| BrokerError::malformed(stream, id, e.to_string()))
    }
}
