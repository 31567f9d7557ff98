use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::broker::{retry_transient, Broker, EntryId, RetryPolicy, StreamEntry};
use crate::config::MonitorConfig;
use crate::error::BrokerError;
use crate::shutdown::Shutdown;
use crate::types::{CoordinationMessage, Priority};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        stream: &str,
        id: EntryId,
        message: CoordinationMessage,
    ) -> anyhow::Result<()>;
}

/// Consumer-group reader over one or more logs.
///
/// Handled entries are acknowledged; entries whose handler failed stay
/// pending and are replayed the next time the monitor starts.
pub struct StreamMonitor {
    broker: Arc<dyn Broker>,
    streams: Vec<String>,
    group: String,
    consumer: String,
    config: MonitorConfig,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
}

impl StreamMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        streams: Vec<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        config: MonitorConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            broker,
            streams,
            group: group.into(),
            consumer: consumer.into(),
            config,
            handler,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates the consumer groups and replays anything left pending.
    pub async fn prepare(&self) -> Result<usize, BrokerError> {
        let mut replayed = 0;
        for stream in &self.streams {
            retry_transient(&self.retry, || self.broker.ensure_group(stream, &self.group)).await?;
            let pending = retry_transient(&self.retry, || {
                self.broker.read_pending(stream, &self.group, &self.consumer)
            })
            .await?;
            replayed += self.dispatch(stream, pending).await?;
        }
        Ok(replayed)
    }

    /// One bounded read across every stream. Returns the number handled.
    pub async fn poll_once(&self) -> Result<usize, BrokerError> {
        let per_stream = per_stream_timeout(self.config.block_timeout(), self.streams.len());
        let mut handled = 0;
        for stream in &self.streams {
            let entries = self
                .broker
                .read_group(
                    stream,
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    per_stream,
                )
                .await?;
            handled += self.dispatch(stream, entries).await?;
        }
        Ok(handled)
    }

    /// Polls until `shutdown` fires. Transient failures back off and retry;
    /// anything else ends the monitor.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<u64, BrokerError> {
        let mut total = self.prepare().await? as u64;
        log::info!(
            "Monitoring {} as {}/{}",
            self.streams.join(", "),
            self.group,
            self.consumer
        );

        loop {
            let polled = tokio::select! {
                _ = shutdown.wait() => break,
                polled = self.poll_once() => polled,
            };
            match polled {
                Ok(n) => total += n as u64,
                Err(e) if e.is_transient() => {
                    log::warn!("Monitor read failed: {}", e);
                    if !shutdown.sleep(self.config.error_backoff()).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        log::info!("Monitor stopped after {} message(s)", total);
        Ok(total)
    }

    async fn dispatch(&self, stream: &str, entries: Vec<StreamEntry>) -> Result<usize, BrokerError> {
        let mut handled = 0;
        for entry in entries {
            let message = match CoordinationMessage::from_fields(stream, entry.id, &entry.fields) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Skipping entry: {}", e);
                    self.ack(stream, entry.id).await?;
                    continue;
                }
            };
            match self.handler.handle(stream, entry.id, message).await {
                Ok(()) => {
                    self.ack(stream, entry.id).await?;
                    handled += 1;
                }
                Err(e) => log::warn!("Handler failed for {} on {}: {}", entry.id, stream, e),
            }
        }
        Ok(handled)
    }

    async fn ack(&self, stream: &str, id: EntryId) -> Result<(), BrokerError> {
        retry_transient(&self.retry, || self.broker.ack(stream, &self.group, id)).await
    }
}

fn per_stream_timeout(total: Duration, streams: usize) -> Duration {
    let share = total / streams.max(1) as u32;
    share.max(Duration::from_millis(1))
}

/// Tallies messages by type; critical ones are logged as they arrive.
#[derive(Debug, Default)]
pub struct AlertCounter {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl AlertCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> u64 {
        self.counts().values().sum()
    }
}

#[async_trait]
impl MessageHandler for AlertCounter {
    async fn handle(
        &self,
        stream: &str,
        id: EntryId,
        message: CoordinationMessage,
    ) -> anyhow::Result<()> {
        if message.priority == Priority::Critical {
            log::warn!(
                "Critical {} on {} ({}) from {:?}: {}",
                message.message_type.as_str(),
                stream,
                id,
                message.from,
                message.reason.as_deref().unwrap_or("-")
            );
        } else {
            log::info!("{} on {} ({})", message.message_type.as_str(), stream, id);
        }
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(message.message_type.as_str().to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Fields, InMemoryBroker};
    use crate::types::MessageType;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyHandler {
        fail: AtomicBool,
        inner: AlertCounter,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(
            &self,
            stream: &str,
            id: EntryId,
            message: CoordinationMessage,
        ) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("not now");
            }
            self.inner.handle(stream, id, message).await
        }
    }

    fn create_test_config() -> MonitorConfig {
        MonitorConfig {
            block_timeout_ms: 20,
            batch_size: 8,
            error_backoff_ms: 5,
        }
    }

    fn alert(priority: Priority) -> Fields {
        CoordinationMessage::new(MessageType::Other("BLOCKED".into()))
            .with_priority(priority)
            .sent_by("nova-2")
            .to_fields()
    }

    #[tokio::test]
    async fn test_counts_and_acks_alerts() {
        let broker = Arc::new(InMemoryBroker::new());
        let counter = Arc::new(AlertCounter::new());
        let monitor = StreamMonitor::new(
            broker.clone(),
            vec!["nova.priority.alerts".into()],
            "ops",
            "ops-1",
            create_test_config(),
            counter.clone(),
        );
        monitor.prepare().await.unwrap();

        broker.append("nova.priority.alerts", alert(Priority::Critical)).await.unwrap();
        broker.append("nova.priority.alerts", alert(Priority::High)).await.unwrap();
        let mut bad = Fields::new();
        bad.insert("timestamp".into(), "nope".into());
        broker.append("nova.priority.alerts", bad).await.unwrap();

        assert_eq!(monitor.poll_once().await.unwrap(), 2);
        assert_eq!(counter.counts()["BLOCKED"], 2);
        assert!(broker
            .read_pending("nova.priority.alerts", "ops", "ops-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_handling_is_replayed_on_restart() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(FlakyHandler {
            fail: AtomicBool::new(true),
            inner: AlertCounter::new(),
        });
        let monitor = StreamMonitor::new(
            broker.clone(),
            vec!["nova.priority.alerts".into()],
            "ops",
            "ops-1",
            create_test_config(),
            handler.clone(),
        );
        monitor.prepare().await.unwrap();
        broker.append("nova.priority.alerts", alert(Priority::High)).await.unwrap();

        assert_eq!(monitor.poll_once().await.unwrap(), 0);
        handler.fail.store(false, Ordering::SeqCst);
        assert_eq!(monitor.prepare().await.unwrap(), 1);
        assert_eq!(handler.inner.total(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let monitor = StreamMonitor::new(
            broker,
            vec!["nova.priority.alerts".into(), "nova.coordination.ops".into()],
            "ops",
            "ops-1",
            create_test_config(),
            Arc::new(AlertCounter::new()),
        );
        let (tx, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn(async move { monitor.run(shutdown).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[test]
    fn test_timeout_is_shared_between_streams() {
        assert_eq!(
            per_stream_timeout(Duration::from_millis(100), 4),
            Duration::from_millis(25)
        );
        assert_eq!(
            per_stream_timeout(Duration::ZERO, 0),
            Duration::from_millis(1)
        );
    }
}
