use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::Config;
use crate::error::ParameterError;
use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Integer,
    Float,
}

impl ParamType {
    pub fn as_str(&self) -> &str {
        match self {
            ParamType::Integer => "integer",
            ParamType::Float => "float",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Integer(v) => *v as f64,
            ParamValue::Float(v) => *v,
        }
    }

    fn as_u64(&self) -> u64 {
        match self {
            ParamValue::Integer(v) => (*v).max(0) as u64,
            ParamValue::Float(v) => v.max(0.0) as u64,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One tunable: its type, inclusive bounds, unit and current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub group: String,
    pub name: String,
    pub kind: ParamType,
    pub min: f64,
    pub max: f64,
    pub unit: String,
    pub current: ParamValue,
}

impl Parameter {
    pub fn key(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }

    /// Parses and bounds-checks `raw` without storing it.
    pub fn validate(&self, raw: &str) -> Result<ParamValue, ParameterError> {
        let raw = raw.trim();
        let mismatch = || ParameterError::TypeMismatch {
            name: self.key(),
            expected: self.kind.as_str().to_string(),
            got: raw.to_string(),
        };

        let value = match self.kind {
            ParamType::Integer => ParamValue::Integer(raw.parse::<i64>().map_err(|_| mismatch())?),
            ParamType::Float => {
                let v = raw.parse::<f64>().map_err(|_| mismatch())?;
                if !v.is_finite() {
                    return Err(mismatch());
                }
                ParamValue::Float(v)
            }
        };

        let v = value.as_f64();
        if v < self.min || v > self.max {
            return Err(ParameterError::OutOfBounds {
                name: self.key(),
                value: v,
                min: self.min,
                max: self.max,
                unit: self.unit.clone(),
            });
        }
        Ok(value)
    }
}

// (group, name, type, min, max, unit)
const SPECS: &[(&str, &str, ParamType, f64, f64, &str)] = &[
    ("safety", "max_requests_per_window", ParamType::Integer, 1.0, 1000.0, "requests"),
    ("safety", "rate_window_secs", ParamType::Integer, 1.0, 3600.0, "seconds"),
    ("safety", "max_concurrent_requests", ParamType::Integer, 1.0, 100.0, "requests"),
    ("safety", "max_consecutive_errors", ParamType::Integer, 1.0, 50.0, "errors"),
    ("safety", "loop_detection_threshold", ParamType::Integer, 2.0, 50.0, "repeats"),
    ("safety", "violation_window_secs", ParamType::Integer, 10.0, 86400.0, "seconds"),
    ("workflow", "priority_threshold", ParamType::Integer, 0.0, 3.0, "rank"),
    ("workflow", "coordination_check_every", ParamType::Integer, 1.0, 100.0, "cycles"),
    ("workflow", "metrics_every", ParamType::Integer, 1.0, 1000.0, "cycles"),
    ("workflow", "phase_task_quota", ParamType::Integer, 1.0, 1000.0, "tasks"),
    ("workflow", "phase_cooldown_secs", ParamType::Integer, 0.0, 3600.0, "seconds"),
    ("workflow", "task_timeout_secs", ParamType::Integer, 1.0, 86400.0, "seconds"),
    ("registry", "heartbeat_interval_secs", ParamType::Integer, 1.0, 3600.0, "seconds"),
    ("registry", "heartbeat_timeout_secs", ParamType::Integer, 10.0, 86400.0, "seconds"),
    ("routing", "capability_weight", ParamType::Float, 0.0, 100.0, "weight"),
    ("routing", "queue_weight", ParamType::Float, 0.0, 100.0, "weight"),
    ("routing", "success_weight", ParamType::Float, 0.0, 100.0, "weight"),
];

fn read_current(config: &Config, group: &str, name: &str) -> Option<ParamValue> {
    let int = |v: u64| Some(ParamValue::Integer(v as i64));
    match (group, name) {
        ("safety", "max_requests_per_window") => int(config.safety.max_requests_per_window as u64),
        ("safety", "rate_window_secs") => int(config.safety.rate_window_secs),
        ("safety", "max_concurrent_requests") => int(config.safety.max_concurrent_requests as u64),
        ("safety", "max_consecutive_errors") => int(config.safety.max_consecutive_errors as u64),
        ("safety", "loop_detection_threshold") => {
            int(config.safety.loop_detection_threshold as u64)
        }
        ("safety", "violation_window_secs") => int(config.safety.violation_window_secs),
        ("workflow", "priority_threshold") => {
            Some(ParamValue::Integer(config.workflow.priority_threshold.rank()))
        }
        ("workflow", "coordination_check_every") => int(config.workflow.coordination_check_every),
        ("workflow", "metrics_every") => int(config.workflow.metrics_every),
        ("workflow", "phase_task_quota") => int(config.workflow.phase_task_quota as u64),
        ("workflow", "phase_cooldown_secs") => int(config.workflow.sleep.phase_transition),
        ("workflow", "task_timeout_secs") => int(config.workflow.task_timeout_secs),
        ("registry", "heartbeat_interval_secs") => int(config.registry.heartbeat_interval_secs),
        ("registry", "heartbeat_timeout_secs") => int(config.registry.heartbeat_timeout_secs),
        ("routing", "capability_weight") => Some(ParamValue::Float(config.routing.capability_weight)),
        ("routing", "queue_weight") => Some(ParamValue::Float(config.routing.queue_weight)),
        ("routing", "success_weight") => Some(ParamValue::Float(config.routing.success_weight)),
        _ => None,
    }
}

fn write_value(config: &mut Config, group: &str, name: &str, value: ParamValue) {
    let n = value.as_u64();
    match (group, name) {
        ("safety", "max_requests_per_window") => config.safety.max_requests_per_window = n as u32,
        ("safety", "rate_window_secs") => config.safety.rate_window_secs = n,
        ("safety", "max_concurrent_requests") => config.safety.max_concurrent_requests = n as u32,
        ("safety", "max_consecutive_errors") => config.safety.max_consecutive_errors = n as u32,
        ("safety", "loop_detection_threshold") => config.safety.loop_detection_threshold = n as u32,
        ("safety", "violation_window_secs") => config.safety.violation_window_secs = n,
        ("workflow", "priority_threshold") => {
            if let Some(priority) = Priority::from_rank(n as i64) {
                config.workflow.priority_threshold = priority;
            }
        }
        ("workflow", "coordination_check_every") => config.workflow.coordination_check_every = n,
        ("workflow", "metrics_every") => config.workflow.metrics_every = n,
        ("workflow", "phase_task_quota") => config.workflow.phase_task_quota = n as u32,
        ("workflow", "phase_cooldown_secs") => config.workflow.sleep.phase_transition = n,
        ("workflow", "task_timeout_secs") => config.workflow.task_timeout_secs = n,
        ("registry", "heartbeat_interval_secs") => config.registry.heartbeat_interval_secs = n,
        ("registry", "heartbeat_timeout_secs") => config.registry.heartbeat_timeout_secs = n,
        ("routing", "capability_weight") => config.routing.capability_weight = value.as_f64(),
        ("routing", "queue_weight") => config.routing.queue_weight = value.as_f64(),
        ("routing", "success_weight") => config.routing.success_weight = value.as_f64(),
        _ => {}
    }
}

/// Typed, bounded view over the tunable subset of [`Config`].
#[derive(Debug, Clone)]
pub struct ParameterTable {
    params: BTreeMap<String, Parameter>,
}

impl ParameterTable {
    pub fn from_config(config: &Config) -> Self {
        let params = SPECS
            .iter()
            .filter_map(|(group, name, kind, min, max, unit)| {
                read_current(config, group, name).map(|current| Parameter {
                    group: group.to_string(),
                    name: name.to_string(),
                    kind: *kind,
                    min: *min,
                    max: *max,
                    unit: unit.to_string(),
                    current,
                })
            })
            .map(|p| (p.key(), p))
            .collect();
        Self { params }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn get(&self, group: &str, name: &str) -> Option<&Parameter> {
        self.params.get(&format!("{}.{}", group, name))
    }

    pub fn validate(&self, group: &str, name: &str, raw: &str) -> Result<ParamValue, ParameterError> {
        self.get(group, name)
            .ok_or_else(|| ParameterError::UnknownParameter(format!("{}.{}", group, name)))?
            .validate(raw)
    }

    /// Validates and stores a new value.
    pub fn set(&mut self, group: &str, name: &str, raw: &str) -> Result<ParamValue, ParameterError> {
        let value = self.validate(group, name, raw)?;
        if let Some(param) = self.params.get_mut(&format!("{}.{}", group, name)) {
            param.current = value;
        }
        Ok(value)
    }

    /// Writes every current value into `config`.
    pub fn apply_to(&self, config: &mut Config) {
        for param in self.params.values() {
            write_value(config, &param.group, &param.name, param.current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_table() -> ParameterTable {
        ParameterTable::from_config(&Config::default())
    }

    #[test]
    fn test_table_reflects_config() {
        let table = create_test_table();
        let param = table.get("safety", "max_requests_per_window").unwrap();
        assert_eq!(param.current, ParamValue::Integer(25));
        assert_eq!(param.unit, "requests");
        assert_eq!(
            table.get("workflow", "priority_threshold").unwrap().current,
            ParamValue::Integer(2)
        );
        assert_eq!(table.iter().count(), SPECS.len());
    }

    #[test]
    fn test_rejects_unknown_and_mistyped() {
        let table = create_test_table();
        assert_eq!(
            table.validate("safety", "warp_speed", "9"),
            Err(ParameterError::UnknownParameter("safety.warp_speed".into()))
        );
        assert!(matches!(
            table.validate("safety", "max_consecutive_errors", "lots"),
            Err(ParameterError::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.validate("routing", "queue_weight", "NaN"),
            Err(ParameterError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_bounds() {
        let table = create_test_table();
        match table.validate("safety", "max_consecutive_errors", "0") {
            Err(ParameterError::OutOfBounds { min, max, unit, .. }) => {
                assert_eq!(min, 1.0);
                assert_eq!(max, 50.0);
                assert_eq!(unit, "errors");
            }
            other => panic!("expected OutOfBounds, got {:?}", other),
        }
    }

    #[test]
    fn test_set_then_apply_updates_config() {
        let mut table = create_test_table();
        table.set("safety", "max_consecutive_errors", "3").unwrap();
        table.set("routing", "success_weight", "2.5").unwrap();
        table.set("workflow", "priority_threshold", "3").unwrap();

        let mut config = Config::default();
        table.apply_to(&mut config);
        assert_eq!(config.safety.max_consecutive_errors, 3);
        assert_eq!(config.routing.success_weight, 2.5);
        assert_eq!(config.workflow.priority_threshold, Priority::Critical);
        assert_eq!(config.registry.heartbeat_timeout_secs, 300);
    }
}
