pub mod memory;
pub mod postgres;

pub use memory::InMemoryBroker;
pub use postgres::PostgresBroker;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::error::BrokerError;

/// Per-log entry identifier; strictly increasing within one named log.
pub type EntryId = u64;

pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Fields,
}

/// The shared log broker every agent coordinates through.
///
/// Besides append-only logs and consumer groups it carries hash-like records
/// and sets, which back the registry's per-agent record and active set.
#[async_trait]
pub trait Broker: Send + Sync {
    // Logs
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError>;
    async fn range(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
    /// Waits at most `timeout` for entries after `after`; returns empty on timeout.
    async fn read_blocking(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
    async fn len(&self, stream: &str) -> Result<usize, BrokerError>;

    // Consumer groups (at-least-once delivery)
    /// Creates the group positioned at the start of the log; no-op if it exists.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
    /// Entries delivered to `consumer` but never acknowledged.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), BrokerError>;

    // Records and sets
    /// Merges `fields` into the record at `key`.
    async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError>;
    async fn get_record(&self, key: &str) -> Result<Option<Fields>, BrokerError>;
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BrokerError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BrokerError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError>;
}

/// Log naming convention shared by every component.
#[derive(Debug, Clone)]
pub struct StreamNames {
    system: String,
}

impl StreamNames {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn coordination(&self, agent_id: &str) -> String {
        format!("{}.coordination.{}", self.system, agent_id)
    }

    pub fn tasks(&self, agent_id: &str) -> String {
        format!("{}.tasks.{}", self.system, agent_id)
    }

    pub fn task_history(&self, agent_id: &str) -> String {
        format!("{}.tasks.{}.history", self.system, agent_id)
    }

    pub fn registry_record(&self, agent_id: &str) -> String {
        format!("{}.registry.{}", self.system, agent_id)
    }

    pub fn registry_active(&self) -> String {
        format!("{}.registry.active", self.system)
    }

    pub fn ecosystem_events(&self) -> String {
        format!("{}.ecosystem.events", self.system)
    }

    pub fn priority_alerts(&self) -> String {
        format!("{}.priority.alerts", self.system)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retries transient broker failures with exponential backoff; everything else
/// is returned immediately.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "Broker call failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_stream_names_follow_convention() {
        let names = StreamNames::new("nova");
        assert_eq!(names.coordination("a1"), "nova.coordination.a1");
        assert_eq!(names.tasks("a1"), "nova.tasks.a1");
        assert_eq!(names.task_history("a1"), "nova.tasks.a1.history");
        assert_eq!(names.registry_record("a1"), "nova.registry.a1");
        assert_eq!(names.registry_active(), "nova.registry.active");
        assert_eq!(names.ecosystem_events(), "nova.ecosystem.events");
        assert_eq!(names.priority_alerts(), "nova.priority.alerts");
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };

        let counter = &calls;
        let result = retry_transient(&policy, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BrokerError::Unavailable("blip".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_fatal_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_transient(&RetryPolicy::default(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Misconfigured("no table".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
