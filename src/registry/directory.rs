use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::heartbeat::{touch_record, HeartbeatHandle};
use super::routing::{score_agent, sort_ranked, ScoredAgent};
use crate::broker::{retry_transient, Broker, EntryId, Fields, RetryPolicy, StreamNames};
use crate::config::{RegistryConfig, RoutingWeights};
use crate::error::BrokerError;
use crate::shutdown::Shutdown;
use crate::types::{AgentId, AgentInfo, AgentStatus, EcosystemEvent, EventType, TaskId};

/// Record field naming the session whose `NOVA_REGISTERED` was published.
const ANNOUNCED_SESSION: &str = "announced_session";

/// Capability directory and liveness tracker over the shared broker.
///
/// The broker record is the source of truth; the in-process liveness map
/// only remembers what the last sweep concluded.
pub struct AgentRegistry {
    broker: Arc<dyn Broker>,
    names: StreamNames,
    config: RwLock<RegistryConfig>,
    weights: RwLock<RoutingWeights>,
    retry: RetryPolicy,
    liveness: RwLock<HashMap<AgentId, AgentStatus>>,
    sweep_lock: Mutex<()>,
    heartbeats: Mutex<HashMap<AgentId, HeartbeatHandle>>,
    heartbeat_period: watch::Sender<Duration>,
    shutdown: Shutdown,
}

impl AgentRegistry {
    pub fn new(
        broker: Arc<dyn Broker>,
        names: StreamNames,
        config: RegistryConfig,
        weights: RoutingWeights,
    ) -> Self {
        let (heartbeat_period, _) = watch::channel(config.heartbeat_interval());
        Self {
            broker,
            names,
            config: RwLock::new(config),
            weights: RwLock::new(weights),
            retry: RetryPolicy::default(),
            liveness: RwLock::new(HashMap::new()),
            sweep_lock: Mutex::new(()),
            heartbeats: Mutex::new(HashMap::new()),
            heartbeat_period,
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn names(&self) -> &StreamNames {
        &self.names
    }

    fn registry_config(&self) -> RegistryConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn routing_weights(&self) -> RoutingWeights {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in new settings. Running heartbeat emitters pick up a changed
    /// interval on their next tick.
    pub fn reconfigure(&self, config: RegistryConfig, weights: RoutingWeights) {
        let period = config.heartbeat_interval();
        self.heartbeat_period.send_if_modified(|current| {
            let changed = *current != period;
            *current = period;
            changed
        });
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
    }

    async fn put(&self, key: &str, fields: Fields) -> Result<(), BrokerError> {
        retry_transient(&self.retry, || self.broker.put_record(key, fields.clone())).await
    }

    async fn announce(&self, event: EcosystemEvent) -> Result<EntryId, BrokerError> {
        let stream = self.names.ecosystem_events();
        let fields = event.to_fields();
        retry_transient(&self.retry, || self.broker.append(&stream, fields.clone())).await
    }

    async fn load(&self, agent_id: &str) -> Result<Option<AgentInfo>, BrokerError> {
        let key = self.names.registry_record(agent_id);
        match retry_transient(&self.retry, || self.broker.get_record(&key)).await? {
            Some(fields) => AgentInfo::from_fields(&key, &fields).map(Some),
            None => Ok(None),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        *self.heartbeat_period.borrow()
    }

    /// Idempotent upsert. Starts the heartbeat emitter if it is not already
    /// running and announces `NOVA_REGISTERED` when the agent joins the
    /// active set or its session has not been announced yet.
    ///
    /// The announcement is marked on the record only after it is published,
    /// so a retry after a failed append announces again.
    pub async fn register(&self, mut info: AgentInfo) -> Result<(), BrokerError> {
        if !info.status.is_live_status() {
            info.status = AgentStatus::Active;
        }
        info.last_heartbeat = Utc::now();

        let key = self.names.registry_record(&info.agent_id);
        let session = info.session_id.to_string();
        let announced = retry_transient(&self.retry, || self.broker.get_record(&key))
            .await?
            .and_then(|fields| fields.get(ANNOUNCED_SESSION).cloned());
        self.put(&key, info.to_fields()).await?;

        let active = self.names.registry_active();
        let joined =
            retry_transient(&self.retry, || self.broker.set_add(&active, &info.agent_id)).await?;

        {
            let mut heartbeats = self.heartbeats.lock().await;
            let running = heartbeats
                .get(&info.agent_id)
                .map(HeartbeatHandle::is_running)
                .unwrap_or(false);
            if !running {
                if let Some(finished) = heartbeats.remove(&info.agent_id) {
                    finished.stop().await;
                }
                let handle = HeartbeatHandle::spawn(
                    Arc::clone(&self.broker),
                    key.clone(),
                    self.heartbeat_period.subscribe(),
                    self.shutdown.clone(),
                );
                heartbeats.insert(info.agent_id.clone(), handle);
            }
        }

        if joined || announced.as_deref() != Some(session.as_str()) {
            self.announce(EcosystemEvent::new(
                EventType::NovaRegistered,
                info.agent_id.clone(),
                json!({
                    "role": info.role,
                    "capabilities": info.capabilities,
                    "session_id": session,
                    "hostname": info.hostname,
                }),
            ))
            .await?;
            let mut marker = Fields::new();
            marker.insert(ANNOUNCED_SESSION.into(), session);
            self.put(&key, marker).await?;
            log::info!(
                "Registered {} ({}) with capabilities {:?}",
                info.agent_id,
                info.role,
                info.capabilities
            );
        }
        Ok(())
    }

    /// Explicit heartbeat with a status update. Returns false for agents
    /// that were never registered.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_task: Option<TaskId>,
    ) -> Result<bool, BrokerError> {
        if self.load(agent_id).await?.is_none() {
            log::warn!("Heartbeat from unregistered agent {}", agent_id);
            return Ok(false);
        }

        let mut fields = Fields::new();
        fields.insert("status".into(), status.as_str().to_string());
        fields.insert("last_heartbeat".into(), Utc::now().to_rfc3339());
        fields.insert(
            "current_task".into(),
            current_task.clone().unwrap_or_default(),
        );
        self.put(&self.names.registry_record(agent_id), fields).await?;

        self.announce(EcosystemEvent::new(
            EventType::Heartbeat,
            agent_id,
            json!({ "status": status.as_str(), "current_task": current_task }),
        ))
        .await?;
        Ok(true)
    }

    /// Timestamp-only refresh, as the background emitter does.
    pub async fn touch(&self, agent_id: &str) -> Result<(), BrokerError> {
        let key = self.names.registry_record(agent_id);
        retry_transient(&self.retry, || touch_record(self.broker.as_ref(), &key)).await
    }

    pub async fn discover(&self, capability: Option<&str>) -> Result<Vec<AgentInfo>, BrokerError> {
        let live = self.sweep_at(Utc::now()).await?;
        Ok(match capability {
            Some(cap) => live.into_iter().filter(|a| a.has_capability(cap)).collect(),
            None => live,
        })
    }

    /// Re-evaluates liveness of every active-set member at `now`.
    ///
    /// Stale agents are flipped to `inactive` with exactly one
    /// `NOVA_INACTIVE` per transition; a stale-marked agent whose heartbeat
    /// resumed is silently made active again. Returns live agents by id.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<AgentInfo>, BrokerError> {
        let _guard = self.sweep_lock.lock().await;
        let timeout = self.registry_config().heartbeat_timeout();
        let active = self.names.registry_active();
        let members = retry_transient(&self.retry, || self.broker.set_members(&active)).await?;

        let mut live = Vec::new();
        let mut observed = HashMap::new();

        for agent_id in members {
            let mut agent = match self.load(&agent_id).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    log::warn!("Active set lists {} without a record; dropping it", agent_id);
                    retry_transient(&self.retry, || self.broker.set_remove(&active, &agent_id))
                        .await?;
                    continue;
                }
                Err(e @ BrokerError::Malformed { .. }) => {
                    log::warn!("Skipping registry record: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if agent.status == AgentStatus::Offline {
                retry_transient(&self.retry, || self.broker.set_remove(&active, &agent_id))
                    .await?;
                observed.insert(agent_id, AgentStatus::Offline);
                continue;
            }

            let key = self.names.registry_record(&agent_id);
            if agent.is_live_at(now, timeout) {
                if agent.status == AgentStatus::Inactive {
                    let mut fields = Fields::new();
                    fields.insert("status".into(), AgentStatus::Active.as_str().to_string());
                    self.put(&key, fields).await?;
                    agent.status = AgentStatus::Active;
                }
                observed.insert(agent_id, agent.status);
                live.push(agent);
            } else {
                if agent.status.is_live_status() {
                    let mut fields = Fields::new();
                    fields.insert("status".into(), AgentStatus::Inactive.as_str().to_string());
                    self.put(&key, fields).await?;

                    let silent_secs = (now - agent.last_heartbeat).num_seconds();
                    self.announce(EcosystemEvent::new(
                        EventType::NovaInactive,
                        agent_id.clone(),
                        json!({
                            "last_heartbeat": agent.last_heartbeat.to_rfc3339(),
                            "silent_secs": silent_secs,
                        }),
                    ))
                    .await?;
                    log::info!("{} marked inactive after {}s without heartbeat", agent_id, silent_secs);
                }
                observed.insert(agent_id, AgentStatus::Inactive);
            }
        }

        *self.liveness.write().unwrap_or_else(PoisonError::into_inner) = observed;
        live.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(live)
    }

    /// Verdicts of the most recent sweep.
    pub fn liveness_snapshot(&self) -> HashMap<AgentId, AgentStatus> {
        self.liveness
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn update_performance(
        &self,
        agent_id: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), BrokerError> {
        let Some(mut agent) = self.load(agent_id).await? else {
            log::warn!("Performance update for unknown agent {}", agent_id);
            return Ok(());
        };
        agent.performance.record(success, duration_ms);

        let mut fields = Fields::new();
        fields.insert(
            "success_count".into(),
            agent.performance.success_count.to_string(),
        );
        fields.insert(
            "total_count".into(),
            agent.performance.total_count.to_string(),
        );
        fields.insert(
            "avg_duration_ms".into(),
            agent.performance.avg_duration_ms.to_string(),
        );
        self.put(&self.names.registry_record(agent_id), fields).await
    }

    /// Pending work for `agent_id`: queued tasks minus completed ones.
    pub async fn queue_depth(&self, agent_id: &str) -> Result<usize, BrokerError> {
        let tasks = self.names.tasks(agent_id);
        let history = self.names.task_history(agent_id);
        let queued = retry_transient(&self.retry, || self.broker.len(&tasks)).await?;
        let done = retry_transient(&self.retry, || self.broker.len(&history)).await?;
        Ok(queued.saturating_sub(done))
    }

    /// Every live agent scored for `task_kind`, best first.
    pub async fn rank_agents(&self, task_kind: &str) -> Result<Vec<ScoredAgent>, BrokerError> {
        let weights = self.routing_weights();
        let mut scored = Vec::new();
        for agent in self.discover(None).await? {
            let depth = self.queue_depth(&agent.agent_id).await?;
            scored.push(score_agent(&agent, task_kind, depth, &weights));
        }
        sort_ranked(&mut scored);
        Ok(scored)
    }

    pub async fn find_best_agent(&self, task_kind: &str) -> Result<Option<AgentId>, BrokerError> {
        Ok(self
            .rank_agents(task_kind)
            .await?
            .into_iter()
            .next()
            .map(|s| s.agent_id))
    }

    pub async fn broadcast(
        &self,
        from: &str,
        event_type: EventType,
        payload: Value,
    ) -> Result<EntryId, BrokerError> {
        self.announce(EcosystemEvent::new(event_type, from, payload))
            .await
    }

    /// Soft delete: stops the heartbeat, marks the record `offline` and
    /// leaves the active set.
    pub async fn unregister(&self, agent_id: &str) -> Result<(), BrokerError> {
        if let Some(handle) = self.heartbeats.lock().await.remove(agent_id) {
            handle.stop().await;
        }

        let mut fields = Fields::new();
        fields.insert("status".into(), AgentStatus::Offline.as_str().to_string());
        self.put(&self.names.registry_record(agent_id), fields)
            .await?;

        let active = self.names.registry_active();
        retry_transient(&self.retry, || self.broker.set_remove(&active, agent_id)).await?;

        self.announce(EcosystemEvent::new(
            EventType::NovaUnregistered,
            agent_id,
            Value::Null,
        ))
        .await?;
        log::info!("Unregistered {}", agent_id);
        Ok(())
    }

    pub async fn heartbeat_running(&self, agent_id: &str) -> bool {
        self.heartbeats
            .lock()
            .await
            .get(agent_id)
            .map(HeartbeatHandle::is_running)
            .unwrap_or(false)
    }

    /// Stops and joins every heartbeat emitter.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.heartbeats.lock().await.drain().collect();
        for (agent_id, handle) in handles {
            handle.stop().await;
            log::debug!("Stopped heartbeat for {}", agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, StreamEntry};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn create_test_registry() -> (Arc<InMemoryBroker>, AgentRegistry) {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = AgentRegistry::new(
            broker.clone(),
            StreamNames::new("nova"),
            RegistryConfig::default(),
            RoutingWeights::default(),
        )
        .with_retry(RetryPolicy::none());
        (broker, registry)
    }

    async fn events_of(broker: &InMemoryBroker, kind: &str) -> usize {
        broker
            .range("nova.ecosystem.events", None, 1000)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.fields.get("type").map(String::as_str) == Some(kind))
            .count()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (broker, registry) = create_test_registry();
        let info = AgentInfo::new("nova-1", "builder", ["developer"]);

        registry.register(info.clone()).await.unwrap();
        registry.register(info).await.unwrap();

        assert_eq!(events_of(&broker, "NOVA_REGISTERED").await, 1);
        assert!(registry.heartbeat_running("nova-1").await);
        assert_eq!(registry.discover(None).await.unwrap().len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_discover_filters_by_capability_in_id_order() {
        let (_broker, registry) = create_test_registry();
        registry
            .register(AgentInfo::new("nova-b", "dev", ["developer"]))
            .await
            .unwrap();
        registry
            .register(AgentInfo::new("nova-a", "dev", ["developer", "tester"]))
            .await
            .unwrap();
        registry
            .register(AgentInfo::new("nova-c", "qa", ["tester"]))
            .await
            .unwrap();

        let devs = registry.discover(Some("developer")).await.unwrap();
        let ids: Vec<_> = devs.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["nova-a", "nova-b"]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_emits_one_inactive_and_reactivates_silently() {
        let (broker, registry) = create_test_registry();
        registry
            .register(AgentInfo::new("nova-1", "dev", ["developer"]))
            .await
            .unwrap();

        let later = Utc::now() + Duration::seconds(301);
        assert!(registry.sweep_at(later).await.unwrap().is_empty());
        assert!(registry.sweep_at(later).await.unwrap().is_empty());
        assert_eq!(events_of(&broker, "NOVA_INACTIVE").await, 1);
        assert_eq!(
            registry.liveness_snapshot().get("nova-1"),
            Some(&AgentStatus::Inactive)
        );

        registry.touch("nova-1").await.unwrap();
        let live = registry.discover(None).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, AgentStatus::Active);
        assert_eq!(events_of(&broker, "NOVA_INACTIVE").await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_find_best_agent_prefers_short_queue() {
        let (broker, registry) = create_test_registry();
        for id in ["nova-a", "nova-b"] {
            registry
                .register(AgentInfo::new(id, "dev", ["developer"]))
                .await
                .unwrap();
        }
        broker
            .append("nova.tasks.nova-a", Fields::new())
            .await
            .unwrap();

        assert_eq!(
            registry.find_best_agent("developer").await.unwrap(),
            Some("nova-b".to_string())
        );

        broker
            .append("nova.tasks.nova-b", Fields::new())
            .await
            .unwrap();
        // Equal scores: lowest id wins, every time.
        for _ in 0..3 {
            assert_eq!(
                registry.find_best_agent("developer").await.unwrap(),
                Some("nova-a".to_string())
            );
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_performance_feeds_routing() {
        let (_broker, registry) = create_test_registry();
        for id in ["nova-a", "nova-b"] {
            registry
                .register(AgentInfo::new(id, "dev", ["developer"]))
                .await
                .unwrap();
        }
        registry.update_performance("nova-b", true, 120).await.unwrap();

        let ranked = registry.rank_agents("developer").await.unwrap();
        assert_eq!(ranked[0].agent_id, "nova-b");
        assert_eq!(ranked[0].score, 15.0);
        assert_eq!(ranked[1].score, 10.0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_soft_deletes() {
        let (broker, registry) = create_test_registry();
        registry
            .register(AgentInfo::new("nova-1", "dev", ["developer"]))
            .await
            .unwrap();
        registry.unregister("nova-1").await.unwrap();

        assert!(!registry.heartbeat_running("nova-1").await);
        assert!(registry.discover(None).await.unwrap().is_empty());
        let record = broker.get_record("nova.registry.nova-1").await.unwrap().unwrap();
        assert_eq!(record["status"], "offline");
        assert_eq!(events_of(&broker, "NOVA_UNREGISTERED").await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_agent_is_rejected() {
        let (_broker, registry) = create_test_registry();
        assert!(!registry
            .heartbeat("ghost", AgentStatus::Busy, None)
            .await
            .unwrap());
    }

    /// Fails the first append to the events log, then delegates.
    struct FlakyEventsBroker {
        inner: InMemoryBroker,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Broker for FlakyEventsBroker {
        async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
            if stream == "nova.ecosystem.events" && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::Unavailable("connection reset".into()));
            }
            self.inner.append(stream, fields).await
        }

        async fn range(
            &self,
            stream: &str,
            after: Option<EntryId>,
            count: usize,
        ) -> Result<Vec<StreamEntry>, BrokerError> {
            self.inner.range(stream, after, count).await
        }

        async fn read_blocking(
            &self,
            stream: &str,
            after: Option<EntryId>,
            count: usize,
            timeout: std::time::Duration,
        ) -> Result<Vec<StreamEntry>, BrokerError> {
            self.inner.read_blocking(stream, after, count, timeout).await
        }

        async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
            self.inner.len(stream).await
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
            self.inner.ensure_group(stream, group).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            timeout: std::time::Duration,
        ) -> Result<Vec<StreamEntry>, BrokerError> {
            self.inner
                .read_group(stream, group, consumer, count, timeout)
                .await
        }

        async fn read_pending(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
        ) -> Result<Vec<StreamEntry>, BrokerError> {
            self.inner.read_pending(stream, group, consumer).await
        }

        async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), BrokerError> {
            self.inner.ack(stream, group, id).await
        }

        async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError> {
            self.inner.put_record(key, fields).await
        }

        async fn get_record(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
            self.inner.get_record(key).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
            self.inner.set_add(key, member).await
        }

        async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
            self.inner.set_remove(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
            self.inner.set_members(key).await
        }
    }

    #[tokio::test]
    async fn test_registration_is_announced_after_failed_publish() {
        let broker = Arc::new(FlakyEventsBroker {
            inner: InMemoryBroker::new(),
            failed: AtomicBool::new(false),
        });
        let registry = AgentRegistry::new(
            broker.clone(),
            StreamNames::new("nova"),
            RegistryConfig::default(),
            RoutingWeights::default(),
        )
        .with_retry(RetryPolicy::none());
        let info = AgentInfo::new("nova-1", "builder", ["developer"]);

        assert!(registry.register(info.clone()).await.is_err());
        registry.register(info.clone()).await.unwrap();
        registry.register(info).await.unwrap();

        assert_eq!(events_of(&broker.inner, "NOVA_REGISTERED").await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_session_is_announced() {
        let (broker, registry) = create_test_registry();
        registry
            .register(AgentInfo::new("nova-1", "builder", ["developer"]))
            .await
            .unwrap();
        registry
            .register(AgentInfo::new("nova-1", "builder", ["developer"]))
            .await
            .unwrap();

        assert_eq!(events_of(&broker, "NOVA_REGISTERED").await, 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure_retimes_running_heartbeats() {
        let (broker, registry) = create_test_registry();
        registry
            .register(AgentInfo::new("nova-1", "builder", ["developer"]))
            .await
            .unwrap();
        let registered = registry.load("nova-1").await.unwrap().unwrap().last_heartbeat;

        let config = RegistryConfig {
            heartbeat_interval_secs: 1,
            ..RegistryConfig::default()
        };
        registry.reconfigure(config, RoutingWeights::default());
        assert_eq!(registry.heartbeat_interval(), std::time::Duration::from_secs(1));

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        let touched = registry.load("nova-1").await.unwrap().unwrap().last_heartbeat;
        assert!(touched > registered);
        assert!(registry.heartbeat_running("nova-1").await);
        assert_eq!(events_of(&broker, "NOVA_REGISTERED").await, 1);
        registry.shutdown().await;
    }
}

