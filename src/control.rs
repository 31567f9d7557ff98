use serde_json::json;
use std::sync::Arc;

use crate::broker::{Broker, EntryId, StreamNames};
use crate::error::ControlError;
use crate::params::ParameterTable;
use crate::types::{ControlCommand, CoordinationMessage, MessageType, Priority};

/// Writes operator commands onto an agent's coordination log.
pub struct ControlClient {
    broker: Arc<dyn Broker>,
    names: StreamNames,
    operator: String,
    params: ParameterTable,
}

impl ControlClient {
    pub fn new(
        broker: Arc<dyn Broker>,
        names: StreamNames,
        operator: impl Into<String>,
        params: ParameterTable,
    ) -> Self {
        Self {
            broker,
            names,
            operator: operator.into(),
            params,
        }
    }

    pub async fn send_mode(
        &self,
        agent_id: &str,
        command: ControlCommand,
    ) -> Result<EntryId, ControlError> {
        let message = CoordinationMessage::control(command, self.operator.clone())
            .with_reason(format!("operator requested {}", command.mode().as_str()));
        let id = self
            .broker
            .append(&self.names.coordination(agent_id), message.to_fields())
            .await?;
        log::info!("Sent {} to {} (entry {})", command.as_str(), agent_id, id);
        Ok(id)
    }

    /// Validates against the parameter table before anything is written.
    pub async fn send_parameter_change(
        &self,
        agent_id: &str,
        param_type: &str,
        param_name: &str,
        raw_value: &str,
    ) -> Result<EntryId, ControlError> {
        let value = self.params.validate(param_type, param_name, raw_value)?;

        let message = CoordinationMessage::new(MessageType::ParameterChange)
            .sent_by(self.operator.clone())
            .with_priority(Priority::Critical)
            .with_reason(format!("tune {}.{}", param_type, param_name))
            .with_payload(json!({
                "param_type": param_type,
                "param_name": param_name,
                "value": value,
            }));

        let id = self
            .broker
            .append(&self.names.coordination(agent_id), message.to_fields())
            .await?;
        log::info!(
            "Sent {}.{} = {} to {} (entry {})",
            param_type,
            param_name,
            value,
            agent_id,
            id
        );
        Ok(id)
    }
}
