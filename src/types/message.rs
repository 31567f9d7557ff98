use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::{AgentId, OperatingMode, Priority};
use crate::broker::Fields;
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    TaskRequest,
    ModeChange,
    ParameterChange,
    StatusRequest,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::ModeChange => "MODE_CHANGE",
            MessageType::ParameterChange => "PARAMETER_CHANGE",
            MessageType::StatusRequest => "STATUS_REQUEST",
            MessageType::Other(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "TASK_REQUEST" | "WORK_ITEM" => MessageType::TaskRequest,
            "MODE_CHANGE" | "CONTROL" => MessageType::ModeChange,
            "PARAMETER_CHANGE" => MessageType::ParameterChange,
            "STATUS_REQUEST" => MessageType::StatusRequest,
            other => MessageType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Manual,
    Auto,
    Train,
}

impl ControlCommand {
    pub fn as_str(&self) -> &str {
        match self {
            ControlCommand::Manual => "/man",
            ControlCommand::Auto => "/auto",
            ControlCommand::Train => "/train",
        }
    }

    pub fn mode(&self) -> OperatingMode {
        match self {
            ControlCommand::Manual => OperatingMode::Manual,
            ControlCommand::Auto => OperatingMode::Auto,
            ControlCommand::Train => OperatingMode::Training,
        }
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('/') {
            "man" | "manual" => Ok(ControlCommand::Manual),
            "auto" => Ok(ControlCommand::Auto),
            "train" | "training" => Ok(ControlCommand::Train),
            other => Err(format!("unknown control command: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub message_type: MessageType,
    pub command: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from: Option<AgentId>,
    pub reason: Option<String>,
    pub priority: Priority,
    pub payload: Value,
}

impl CoordinationMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            command: None,
            timestamp: Utc::now(),
            from: None,
            reason: None,
            priority: Priority::default(),
            payload: Value::Null,
        }
    }

    pub fn control(command: ControlCommand, from: impl Into<AgentId>) -> Self {
        let mut message = Self::new(MessageType::ModeChange).sent_by(from);
        message.command = Some(command.as_str().to_string());
        message.priority = Priority::Critical;
        message
    }

    pub fn sent_by(mut self, sender: impl Into<AgentId>) -> Self {
        self.from = Some(sender.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn control_command(&self) -> Option<ControlCommand> {
        self.command.as_deref().and_then(|c| c.parse().ok())
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("type".into(), self.message_type.as_str().to_string());
        fields.insert("timestamp".into(), self.timestamp.to_rfc3339());
        fields.insert("priority".into(), self.priority.as_str().to_string());
        if let Some(command) = &self.command {
            fields.insert("command".into(), command.clone());
        }
        if let Some(from) = &self.from {
            fields.insert("from".into(), from.clone());
        }
        if let Some(reason) = &self.reason {
            fields.insert("reason".into(), reason.clone());
        }
        if !self.payload.is_null() {
            fields.insert("payload".into(), self.payload.to_string());
        }
        fields
    }

    /// Decodes a broker entry; `type` and `timestamp` are the only required fields.
    pub fn from_fields(stream: &str, id: u64, fields: &Fields) -> Result<Self, BrokerError> {
        let message_type = fields
            .get("type")
            .map(|t| MessageType::parse(t))
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing field type"))?;
        let timestamp = fields
            .get("timestamp")
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing field timestamp"))
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| BrokerError::malformed(stream, id, e.to_string()))
            })?;
        let priority = match fields.get("priority") {
            Some(raw) => raw
                .parse::<Priority>()
                .map_err(|e| BrokerError::malformed(stream, id, e))?,
            None => Priority::default(),
        };
        let payload = match fields.get("payload") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BrokerError::malformed(stream, id, e.to_string()))?,
            None => Value::Null,
        };

        Ok(Self {
            message_type,
            command: fields.get("command").cloned(),
            timestamp,
            from: fields.get("from").cloned(),
            reason: fields.get("reason").cloned(),
            priority,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NovaRegistered,
    NovaInactive,
    NovaUnregistered,
    MetricsUpdate,
    Heartbeat,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::NovaRegistered => "NOVA_REGISTERED",
            EventType::NovaInactive => "NOVA_INACTIVE",
            EventType::NovaUnregistered => "NOVA_UNREGISTERED",
            EventType::MetricsUpdate => "METRICS_UPDATE",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::Custom(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "NOVA_REGISTERED" => EventType::NovaRegistered,
            "NOVA_INACTIVE" => EventType::NovaInactive,
            "NOVA_UNREGISTERED" => EventType::NovaUnregistered,
            "METRICS_UPDATE" => EventType::MetricsUpdate,
            "HEARTBEAT" => EventType::Heartbeat,
            other => EventType::Custom(other.to_string()),
        }
    }
}

/// Lifecycle event fanned out on the shared events log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcosystemEvent {
    pub event_type: EventType,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl EcosystemEvent {
    pub fn new(event_type: EventType, agent_id: impl Into<AgentId>, payload: Value) -> Self {
        Self {
            event_type,
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("type".into(), self.event_type.as_str().to_string());
        fields.insert("agent_id".into(), self.agent_id.clone());
        fields.insert("timestamp".into(), self.timestamp.to_rfc3339());
        fields.insert("payload".into(), self.payload.to_string());
        fields
    }

    pub fn from_fields(stream: &str, id: u64, fields: &Fields) -> Result<Self, BrokerError> {
        let event_type = fields
            .get("type")
            .map(|t| EventType::parse(t))
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing field type"))?;
        let timestamp = fields
            .get("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| BrokerError::malformed(stream, id, "missing or invalid timestamp"))?;

        Ok(Self {
            event_type,
            agent_id: fields.get("agent_id").cloned().unwrap_or_default(),
            timestamp,
            payload: fields
                .get("payload")
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or(Value::Null),
        })
    }
}
