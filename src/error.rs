use thiserror::Error;

/// Failures surfaced by a [`Broker`](crate::broker::Broker) implementation.
///
/// Callers branch on the variant: `Unavailable` is retried and absorbed,
/// `Malformed` is skipped with a diagnostic, `Misconfigured` is escalated.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unavailable(String),

    #[error("malformed record {id} on {stream}: {reason}")]
    Malformed {
        stream: String,
        id: String,
        reason: String,
    },

    #[error("broker misconfigured: {0}")]
    Misconfigured(String),
}

impl BrokerError {
    pub fn malformed(stream: &str, id: impl ToString, reason: impl Into<String>) -> Self {
        BrokerError::Malformed {
            stream: stream.to_string(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => BrokerError::Misconfigured(e.to_string()),
            sqlx::Error::Database(e) => BrokerError::Misconfigured(e.to_string()),
            sqlx::Error::ColumnNotFound(c) => {
                BrokerError::Misconfigured(format!("column not found: {}", c))
            }
            other => BrokerError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Malformed {
            stream: String::new(),
            id: String::new(),
            reason: err.to_string(),
        }
    }
}

/// Rejections from the tunable parameter table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("unknown parameter {0}")]
    UnknownParameter(String),

    #[error("parameter {name} expects {expected}, got {got:?}")]
    TypeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("parameter {name} = {value} outside [{min}, {max}] {unit}")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
        unit: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors escaping a single workflow cycle.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl WorkflowError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::Broker(e) if e.is_transient())
    }
}

/// Failures of the operator-facing control writers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
