use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::{AgentId, AgentStatus, SessionId, TaskId};
use crate::broker::Fields;
use crate::error::BrokerError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub success_count: u64,
    pub total_count: u64,
    pub avg_duration_ms: f64,
}

impl PerformanceCounters {
    /// Zero when the agent has no history yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_count as f64
    }

    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let previous_total = self.total_count as f64;
        self.total_count += 1;
        if success {
            self.success_count += 1;
        }
        self.avg_duration_ms =
            (self.avg_duration_ms * previous_total + duration_ms as f64) / self.total_count as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub session_id: SessionId,
    pub hostname: String,
    pub current_task: Option<TaskId>,
    pub metadata: Value,
    pub performance: PerformanceCounters,
}

impl AgentInfo {
    pub fn new(
        agent_id: impl Into<AgentId>,
        role: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Active,
            last_heartbeat: Utc::now(),
            session_id: SessionId::new_v4(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            current_task: None,
            metadata: Value::Object(Default::default()),
            performance: PerformanceCounters::default(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Liveness is computed from the heartbeat age, never read from a cached flag.
    pub fn is_live_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status != AgentStatus::Offline && now - self.last_heartbeat <= timeout
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("agent_id".into(), self.agent_id.clone());
        fields.insert("role".into(), self.role.clone());
        fields.insert(
            "capabilities".into(),
            serde_json::to_string(&self.capabilities).unwrap_or_else(|_| "[]".into()),
        );
        fields.insert("status".into(), self.status.as_str().to_string());
        fields.insert("last_heartbeat".into(), self.last_heartbeat.to_rfc3339());
        fields.insert("session_id".into(), self.session_id.to_string());
        fields.insert("hostname".into(), self.hostname.clone());
        fields.insert(
            "current_task".into(),
            self.current_task.clone().unwrap_or_default(),
        );
        fields.insert("metadata".into(), self.metadata.to_string());
        fields.insert(
            "success_count".into(),
            self.performance.success_count.to_string(),
        );
        fields.insert("total_count".into(), self.performance.total_count.to_string());
        fields.insert(
            "avg_duration_ms".into(),
            self.performance.avg_duration_ms.to_string(),
        );
        fields
    }

    pub fn from_fields(key: &str, fields: &Fields) -> Result<Self, BrokerError> {
        let required = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| BrokerError::malformed(key, name, format!("missing field {}", name)))
        };

        let agent_id = required("agent_id")?.clone();
        let status = required("status")?
            .parse::<AgentStatus>()
            .map_err(|e| BrokerError::malformed(key, "status", e))?;
        let last_heartbeat = DateTime::parse_from_rfc3339(required("last_heartbeat")?)
            .map_err(|e| BrokerError::malformed(key, "last_heartbeat", e.to_string()))?
            .with_timezone(&Utc);

        let capabilities: BTreeSet<String> = match fields.get("capabilities") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BrokerError::malformed(key, "capabilities", e.to_string()))?,
            None => BTreeSet::new(),
        };
        let session_id = fields
            .get("session_id")
            .and_then(|s| s.parse::<SessionId>().ok())
            .unwrap_or_else(SessionId::nil);
        let metadata = fields
            .get("metadata")
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or(Value::Null);
        let current_task = fields
            .get("current_task")
            .filter(|t| !t.is_empty())
            .cloned();

        let parse_u64 = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Ok(Self {
            agent_id,
            role: fields.get("role").cloned().unwrap_or_default(),
            capabilities,
            status,
            last_heartbeat,
            session_id,
            hostname: fields.get("hostname").cloned().unwrap_or_default(),
            current_task,
            metadata,
            performance: PerformanceCounters {
                success_count: parse_u64("success_count"),
                total_count: parse_u64("total_count"),
                avg_duration_ms: fields
                    .get("avg_duration_ms")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0),
            },
        })
    }
}
