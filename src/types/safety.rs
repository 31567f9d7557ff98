use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ViolationKind;

/// A recorded safety violation. Never mutated after it enters the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
}

impl SafetyViolation {
    pub fn new(kind: ViolationKind, context: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            context,
        }
    }

    pub fn at(kind: ViolationKind, context: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            context,
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.context.get("description").and_then(Value::as_str)
    }
}
