use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, EntryId, Fields, StreamEntry};
use crate::error::BrokerError;

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, String>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<StreamEntry>>,
    groups: HashMap<(String, String), GroupState>,
    records: HashMap<String, Fields>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// Process-local broker used for tests and single-process runs.
///
/// `set_available(false)` makes every call fail with `Unavailable`, which is
/// how connectivity loss is simulated.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<RwLock<Inner>>,
    appended: Arc<Notify>,
    available: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            appended: Arc::new(Notify::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker offline".into()))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, BrokerError> {
        self.check_available()?;
        self.inner
            .read()
            .map_err(|_| BrokerError::Unavailable("broker lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, BrokerError> {
        self.check_available()?;
        self.inner
            .write()
            .map_err(|_| BrokerError::Unavailable("broker lock poisoned".into()))
    }

    fn entries_after(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let inner = self.read()?;
        let after = after.unwrap_or(0);
        Ok(inner
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > after)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn deliver_to_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut inner = self.write()?;
        let Inner {
            streams, groups, ..
        } = &mut *inner;

        let state = groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .ok_or_else(|| {
                BrokerError::Misconfigured(format!("no group {} on {}", group, stream))
            })?;

        let delivered: Vec<StreamEntry> = streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > state.last_delivered)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for entry in &delivered {
            state.last_delivered = entry.id;
            state.pending.insert(entry.id, consumer.to_string());
        }

        Ok(delivered)
    }

    /// Polls `fetch` until it yields entries or `timeout` elapses, waking on appends.
    async fn wait_for<F>(&self, timeout: Duration, mut fetch: F) -> Result<Vec<StreamEntry>, BrokerError>
    where
        F: FnMut() -> Result<Vec<StreamEntry>, BrokerError>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = fetch()?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        let id = {
            let mut inner = self.write()?;
            let entries = inner.streams.entry(stream.to_string()).or_default();
            let id = entries.last().map(|e| e.id).unwrap_or(0) + 1;
            entries.push(StreamEntry { id, fields });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.entries_after(stream, after, count)
    }

    async fn read_blocking(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.wait_for(timeout, || self.entries_after(stream, after, count))
            .await
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let inner = self.read()?;
        Ok(inner.streams.get(stream).map(Vec::len).unwrap_or(0))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut inner = self.write()?;
        inner
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.wait_for(timeout, || {
            self.deliver_to_group(stream, group, consumer, count)
        })
        .await
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let inner = self.read()?;
        let Some(state) = inner.groups.get(&(stream.to_string(), group.to_string())) else {
            return Ok(Vec::new());
        };
        let entries = inner.streams.get(stream);
        Ok(state
            .pending
            .iter()
            .filter(|(_, owner)| owner.as_str() == consumer)
            .filter_map(|(id, _)| {
                entries.and_then(|all| all.iter().find(|e| e.id == *id).cloned())
            })
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), BrokerError> {
        let mut inner = self.write()?;
        if let Some(state) = inner
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
        {
            state.pending.remove(&id);
        }
        Ok(())
    }

    async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError> {
        let mut inner = self.write()?;
        inner
            .records
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
        let inner = self.read()?;
        Ok(inner.records.get(key).cloned())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let mut inner = self.write()?;
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let mut inner = self.write()?;
        Ok(inner
            .sets
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let inner = self.read()?;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
