use anyhow::anyhow;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::collaborators::{InboundMessage, StreamController, TaskExecutor, TaskTracker};
use crate::broker::EntryId;
use crate::config::Config;
use crate::error::{BrokerError, WorkflowError};
use crate::params::ParameterTable;
use crate::registry::AgentRegistry;
use crate::safety::SafetyOrchestrator;
use crate::types::{
    AgentInfo, AgentStatus, CoordinationMessage, EventType, MessageType, OperatingMode, Priority,
    TaskOutcome, TaskRecord, TaskSpec, WorkflowCycle, WorkflowSnapshot, WorkflowState,
};

const PROCESSED_MEMORY: usize = 1024;

/// Everything the state machine talks to.
pub struct WorkflowDeps {
    pub safety: Arc<SafetyOrchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub streams: Arc<dyn StreamController>,
    pub tasks: Arc<dyn TaskTracker>,
    pub executor: Arc<dyn TaskExecutor>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskRequestPayload {
    task_id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    capability: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    command: Option<String>,
    priority: Option<Priority>,
}

/// Per-agent execution cycle.
///
/// Exactly one state is current. Each call to [`execute_cycle`] performs the
/// work of that state and moves to the next one; no call blocks for longer
/// than one bounded broker read or one task execution.
///
/// [`execute_cycle`]: WorkflowStateMachine::execute_cycle
pub struct WorkflowStateMachine {
    config: Config,
    params: ParameterTable,
    agent: AgentInfo,
    safety: Arc<SafetyOrchestrator>,
    registry: Arc<AgentRegistry>,
    streams: Arc<dyn StreamController>,
    tasks: Arc<dyn TaskTracker>,
    executor: Arc<dyn TaskExecutor>,
    state: WorkflowState,
    mode: OperatingMode,
    initialized: bool,
    cycle_count: u64,
    phase: u64,
    tasks_in_phase: u32,
    inbox: BTreeMap<EntryId, CoordinationMessage>,
    processed: BTreeSet<EntryId>,
    audit: VecDeque<WorkflowCycle>,
    snapshot: watch::Sender<WorkflowSnapshot>,
}

impl WorkflowStateMachine {
    pub fn new(config: Config, agent: AgentInfo, deps: WorkflowDeps) -> Self {
        let (snapshot, _) = watch::channel(WorkflowSnapshot::initial(agent.agent_id.clone()));
        Self {
            params: ParameterTable::from_config(&config),
            config,
            agent,
            safety: deps.safety,
            registry: deps.registry,
            streams: deps.streams,
            tasks: deps.tasks,
            executor: deps.executor,
            state: WorkflowState::Initializing,
            mode: OperatingMode::default(),
            initialized: false,
            cycle_count: 0,
            phase: 0,
            tasks_in_phase: 0,
            inbox: BTreeMap::new(),
            processed: BTreeSet::new(),
            audit: VecDeque::new(),
            snapshot,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn tasks_completed_in_phase(&self) -> u32 {
        self.tasks_in_phase
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn audit(&self) -> &VecDeque<WorkflowCycle> {
        &self.audit
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.snapshot.subscribe()
    }

    /// Adaptive sleep before running `state`.
    pub fn sleep_for(&self, state: WorkflowState) -> Duration {
        self.config.workflow.sleep.for_state(state)
    }

    pub async fn execute_cycle(&mut self) -> Result<WorkflowState, WorkflowError> {
        let started = Instant::now();
        let entry = self.state;
        self.cycle_count += 1;

        let next = match self.step(entry).await {
            Ok(next) => next,
            Err(e) if e.is_transient() => {
                log::warn!("Cycle {} in {} made no progress: {}", self.cycle_count, entry, e);
                entry
            }
            Err(e) => {
                self.record_cycle(entry, entry, started);
                return Err(e);
            }
        };

        if next == WorkflowState::ErrorRecovery && entry != WorkflowState::ErrorRecovery {
            self.enter_error_recovery();
        }
        if next != entry {
            log::debug!("{} -> {}", entry, next);
        }
        self.state = next;
        self.record_cycle(entry, next, started);
        Ok(next)
    }

    /// Escalation path for failures caught outside the machine.
    pub fn force_safety_pause(&mut self, reason: &str) {
        log::error!("Forcing SAFETY_PAUSE from {}: {}", self.state, reason);
        self.state = WorkflowState::SafetyPause;
        self.publish_snapshot();
    }

    async fn step(&mut self, entry: WorkflowState) -> Result<WorkflowState, WorkflowError> {
        let assessment = self.safety.assess();
        if assessment.level.blocks_progress() {
            if entry != WorkflowState::SafetyPause {
                log::warn!("Safety level {}; pausing", assessment.level.as_str());
            }
            return Ok(WorkflowState::SafetyPause);
        }
        if assessment.error_limit_reached && entry != WorkflowState::ErrorRecovery {
            return Ok(WorkflowState::ErrorRecovery);
        }

        match entry {
            WorkflowState::Initializing => self.initialize().await,
            WorkflowState::StreamCheck => self.check_streams().await,
            WorkflowState::WorkDiscovery => self.discover_work().await,
            WorkflowState::TaskExecution => self.execute_task().await,
            WorkflowState::ProgressUpdate => self.update_progress().await,
            WorkflowState::CompletionRoutine => Ok(self.complete_phase().await),
            WorkflowState::PhaseTransition => Ok(self.transition_phase()),
            WorkflowState::ErrorRecovery => self.recover().await,
            WorkflowState::SafetyPause => Ok(self.resume_state()),
        }
    }

    fn resume_state(&self) -> WorkflowState {
        if self.initialized {
            WorkflowState::StreamCheck
        } else {
            WorkflowState::Initializing
        }
    }

    /// TASK_EXECUTION only follows a safe check.
    fn proceed_to_execution(&self) -> WorkflowState {
        let assessment = self.safety.assess();
        if assessment.is_safe {
            WorkflowState::TaskExecution
        } else if assessment.level.blocks_progress() {
            WorkflowState::SafetyPause
        } else {
            WorkflowState::ErrorRecovery
        }
    }

    async fn initialize(&mut self) -> Result<WorkflowState, WorkflowError> {
        let mut info = self.agent.clone();
        info.status = AgentStatus::Active;
        self.registry.register(info).await?;
        self.streams.prepare().await?;
        self.streams
            .publish_event(
                EventType::Custom("NOVA_STATUS".into()),
                json!({ "state": WorkflowState::StreamCheck, "mode": self.mode, "phase": self.phase }),
            )
            .await?;
        self.initialized = true;
        log::info!("{} initialized in {} mode", self.agent.agent_id, self.mode.as_str());
        Ok(WorkflowState::StreamCheck)
    }

    async fn check_streams(&mut self) -> Result<WorkflowState, WorkflowError> {
        let threshold = self.config.workflow.priority_threshold;
        let messages = self
            .streams
            .pending_messages(self.config.workflow.max_messages_per_check)
            .await?;

        for InboundMessage { id, message } in messages {
            if self.processed.contains(&id) {
                self.streams.acknowledge(id).await?;
                continue;
            }
            if self.inbox.contains_key(&id) {
                continue;
            }

            let kind = message.message_type.clone();
            match kind {
                MessageType::ModeChange => {
                    self.apply_mode_change(&message);
                    self.finish(id).await?;
                }
                MessageType::ParameterChange => {
                    self.apply_parameter_change(&message);
                    self.finish(id).await?;
                }
                MessageType::StatusRequest => {
                    self.publish_status().await?;
                    self.finish(id).await?;
                }
                _ if message.priority >= threshold => {
                    self.inbox.insert(id, message);
                }
                MessageType::TaskRequest => {
                    if let Some(task) = self.task_from_message(id, &message) {
                        self.claim_or_route(task).await?;
                    }
                    self.finish(id).await?;
                }
                MessageType::Other(name) => {
                    log::debug!("Ignoring {} below priority threshold", name);
                    self.finish(id).await?;
                }
            }
        }

        if !self.inbox.is_empty() {
            return Ok(WorkflowState::WorkDiscovery);
        }
        if self.mode != OperatingMode::Manual && self.tasks.ready_len().await? > 0 {
            return Ok(self.proceed_to_execution());
        }
        Ok(WorkflowState::CompletionRoutine)
    }

    async fn discover_work(&mut self) -> Result<WorkflowState, WorkflowError> {
        let inbox = std::mem::take(&mut self.inbox);
        let mut claimed = 0;

        for (id, message) in inbox {
            match message.message_type {
                MessageType::TaskRequest => {
                    if let Some(task) = self.task_from_message(id, &message) {
                        if self.claim_or_route(task).await? {
                            claimed += 1;
                        }
                    }
                }
                _ => {
                    self.streams.raise_alert(&message).await?;
                    log::info!(
                        "Raised {} from {:?} as priority alert",
                        message.message_type.as_str(),
                        message.from
                    );
                }
            }
            self.finish(id).await?;
        }

        if claimed > 0 {
            Ok(self.proceed_to_execution())
        } else {
            Ok(WorkflowState::PhaseTransition)
        }
    }

    async fn execute_task(&mut self) -> Result<WorkflowState, WorkflowError> {
        // Tasks blocked on dependencies wait for the next stream check.
        let Some(task) = self.tasks.next_ready().await? else {
            log::debug!("No ready task");
            return Ok(WorkflowState::CompletionRoutine);
        };

        if let Some(command) = &task.command {
            let (safe, violations) = self.safety.validate_hook_content(command);
            if !safe {
                let reason = format!(
                    "refused dangerous command: {}",
                    violations
                        .first()
                        .and_then(|v| v.description())
                        .unwrap_or("dangerous content")
                );
                log::warn!("Task {} {}", task.id, reason);
                self.finish_task(&task, TaskOutcome::Failed { reason }, 0)
                    .await?;
                return Ok(WorkflowState::ProgressUpdate);
            }
        }

        let validation = self.safety.validate_api_request("task_execution");
        if !validation.is_safe {
            log::warn!(
                "Deferring task {}: {}",
                task.id,
                validation.reason.as_deref().unwrap_or("request denied")
            );
            return Ok(WorkflowState::ProgressUpdate);
        }
        let _permit = validation.permit;

        self.safety.record_action(&task.fingerprint());
        self.report_status(AgentStatus::Busy, Some(task.id.clone()))
            .await;

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.workflow.task_timeout(),
            self.executor.execute(&task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "timed out after {}s",
                self.config.workflow.task_timeout_secs
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(output) => TaskOutcome::Succeeded { output },
            Err(e) => TaskOutcome::Failed {
                reason: e.to_string(),
            },
        };
        self.finish_task(&task, outcome, duration_ms).await?;
        self.report_status(AgentStatus::Active, None).await;
        Ok(WorkflowState::ProgressUpdate)
    }

    async fn update_progress(&mut self) -> Result<WorkflowState, WorkflowError> {
        let assessment = self.safety.assess();
        if assessment.error_limit_reached || assessment.loop_detected {
            return Ok(WorkflowState::ErrorRecovery);
        }
        if self.tasks_in_phase >= self.config.workflow.phase_task_quota
            || self.mode == OperatingMode::Manual
        {
            return Ok(WorkflowState::CompletionRoutine);
        }
        if self.tasks.ready_len().await? == 0 {
            return Ok(WorkflowState::CompletionRoutine);
        }
        Ok(self.proceed_to_execution())
    }

    async fn complete_phase(&mut self) -> WorkflowState {
        let summary = json!({
            "phase": self.phase,
            "tasks_completed": self.tasks_in_phase,
            "mode": self.mode,
        });
        if let Err(e) = self
            .streams
            .publish_event(EventType::Custom("PHASE_COMPLETE".into()), summary)
            .await
        {
            log::warn!("Could not publish phase summary: {}", e);
        }
        WorkflowState::PhaseTransition
    }

    fn transition_phase(&mut self) -> WorkflowState {
        log::info!(
            "Phase {} closed with {} task(s)",
            self.phase,
            self.tasks_in_phase
        );
        self.phase += 1;
        self.tasks_in_phase = 0;
        WorkflowState::StreamCheck
    }

    fn enter_error_recovery(&mut self) {
        log::warn!("Entering ERROR_RECOVERY; resetting error counter and loop detection");
        self.safety.reset_error_counter();
        self.safety.clear_loop_detection();
    }

    async fn recover(&mut self) -> Result<WorkflowState, WorkflowError> {
        // Unacknowledged messages are re-read from the broker.
        self.inbox.clear();
        if !self.initialized {
            return Ok(WorkflowState::Initializing);
        }
        self.streams.prepare().await?;
        if let Err(e) = self
            .streams
            .publish_event(
                EventType::Custom("NOVA_RECOVERED".into()),
                json!({ "phase": self.phase }),
            )
            .await
        {
            log::warn!("Could not announce recovery: {}", e);
        }
        Ok(WorkflowState::StreamCheck)
    }

    async fn finish(&mut self, id: EntryId) -> Result<(), BrokerError> {
        self.streams.acknowledge(id).await?;
        self.processed.insert(id);
        while self.processed.len() > PROCESSED_MEMORY {
            self.processed.pop_first();
        }
        Ok(())
    }

    async fn finish_task(
        &mut self,
        task: &TaskSpec,
        outcome: TaskOutcome,
        duration_ms: u64,
    ) -> Result<(), BrokerError> {
        match &outcome {
            TaskOutcome::Succeeded { .. } => {
                self.safety.record_task_success();
                log::info!("Task {} succeeded in {}ms", task.id, duration_ms);
            }
            TaskOutcome::Failed { reason } => {
                let errors = self.safety.record_task_failure(reason);
                log::warn!("Task {} failed ({} in a row): {}", task.id, errors, reason);
            }
        }
        let success = outcome.is_success();
        self.tasks_in_phase += 1;

        self.tasks
            .complete(TaskRecord::new(
                task,
                self.agent.agent_id.clone(),
                outcome,
                duration_ms,
                self.mode,
            ))
            .await?;

        if let Err(e) = self
            .registry
            .update_performance(&self.agent.agent_id, success, duration_ms)
            .await
        {
            log::warn!("Could not update performance counters: {}", e);
        }
        Ok(())
    }

    async fn report_status(&self, status: AgentStatus, current_task: Option<String>) {
        if let Err(e) = self
            .registry
            .heartbeat(&self.agent.agent_id, status, current_task)
            .await
        {
            log::warn!("Heartbeat failed: {}", e);
        }
    }

    /// Queues `task` locally, or forwards it when another live agent is a
    /// better fit for a capability this agent lacks. True if queued here.
    async fn claim_or_route(&mut self, task: TaskSpec) -> Result<bool, BrokerError> {
        if let Some(kind) = task.task_kind() {
            if !self.agent.has_capability(kind) {
                if let Some(best) = self.registry.find_best_agent(kind).await? {
                    if best != self.agent.agent_id {
                        let forwarded = self.tasks.forward(&best, task.clone()).await?;
                        if forwarded {
                            log::info!("Routed task {} ({}) to {}", task.id, kind, best);
                        }
                        return Ok(false);
                    }
                }
            }
        }

        let id = task.id.clone();
        let created = self.tasks.enqueue(task).await?;
        if created {
            log::info!("Queued task {}", id);
        } else {
            log::debug!("Task {} already queued", id);
        }
        Ok(created)
    }

    fn task_from_message(&self, id: EntryId, message: &CoordinationMessage) -> Option<TaskSpec> {
        let payload: TaskRequestPayload = match &message.payload {
            Value::Null => TaskRequestPayload::default(),
            raw => match serde_json::from_value(raw.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("Discarding task request {}: {}", id, e);
                    return None;
                }
            },
        };

        let task_id = payload
            .task_id
            .unwrap_or_else(|| format!("{}-{}", self.agent.agent_id, id));
        let title = payload
            .title
            .or_else(|| message.reason.clone())
            .unwrap_or_else(|| format!("task {}", task_id));

        let mut task = TaskSpec::new(task_id, title).with_priority(payload.priority.unwrap_or(message.priority));
        task.description = payload.description.unwrap_or_default();
        task.required_capabilities = payload.required_capabilities;
        if let Some(capability) = payload.capability {
            if !task.required_capabilities.contains(&capability) {
                task.required_capabilities.insert(0, capability);
            }
        }
        task.dependencies = payload.dependencies;
        task.command = payload.command;
        task.source_entry = Some(id);
        Some(task)
    }

    fn apply_mode_change(&mut self, message: &CoordinationMessage) {
        match message.control_command() {
            Some(command) => {
                let mode = command.mode();
                if mode != self.mode {
                    log::info!(
                        "Mode {} -> {} (from {:?})",
                        self.mode.as_str(),
                        mode.as_str(),
                        message.from
                    );
                }
                self.mode = mode;
            }
            None => log::warn!("MODE_CHANGE without a known command: {:?}", message.command),
        }
    }

    fn apply_parameter_change(&mut self, message: &CoordinationMessage) {
        let payload = &message.payload;
        let (Some(group), Some(name)) = (
            payload.get("param_type").and_then(Value::as_str),
            payload.get("param_name").and_then(Value::as_str),
        ) else {
            log::warn!("PARAMETER_CHANGE without param_type/param_name");
            return;
        };
        let raw = match payload.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                log::warn!("PARAMETER_CHANGE for {}.{} without a value", group, name);
                return;
            }
            Some(other) => other.to_string(),
        };

        let mut params = self.params.clone();
        let value = match params.set(group, name, &raw) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Rejected parameter change: {}", e);
                return;
            }
        };
        let mut config = self.config.clone();
        params.apply_to(&mut config);
        if let Err(e) = config.validate() {
            log::warn!("Rejected {}.{} = {}: {}", group, name, value, e);
            return;
        }

        self.params = params;
        self.config = config;
        self.safety.reconfigure(self.config.safety.clone());
        self.registry
            .reconfigure(self.config.registry.clone(), self.config.routing.clone());
        log::info!("Applied {}.{} = {}", group, name, value);
    }

    async fn publish_status(&self) -> Result<(), BrokerError> {
        let snapshot = self.snapshot.borrow().clone();
        let payload = serde_json::to_value(&snapshot)?;
        self.streams
            .publish_event(EventType::Custom("NOVA_STATUS".into()), payload)
            .await?;
        Ok(())
    }

    fn record_cycle(&mut self, entry: WorkflowState, exit: WorkflowState, started: Instant) {
        self.audit.push_back(WorkflowCycle {
            cycle: self.cycle_count,
            entry_state: entry,
            exit_state: exit,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        while self.audit.len() > self.config.workflow.audit_capacity {
            self.audit.pop_front();
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(WorkflowSnapshot {
            agent_id: self.agent.agent_id.clone(),
            state: self.state,
            mode: self.mode,
            cycle_count: self.cycle_count,
            tasks_completed_in_phase: self.tasks_in_phase,
            last_cycle: self.audit.back().cloned(),
            updated_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, RetryPolicy, StreamNames};
    use crate::workflow::collaborators::{BrokerStreamController, BrokerTaskTracker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, task: &TaskSpec) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("{} failed", task.id))
            } else {
                Ok(format!("{} done", task.id))
            }
        }
    }

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.agent_id = "nova-1".into();
        config.workflow.broker_read_timeout_ms = 10;
        config
    }

    fn create_test_machine(
        broker: Arc<InMemoryBroker>,
        config: Config,
        fail: bool,
    ) -> (WorkflowStateMachine, Arc<ScriptedExecutor>, Arc<SafetyOrchestrator>) {
        let names = StreamNames::new(config.system.clone());
        let safety = Arc::new(SafetyOrchestrator::new(config.safety.clone()));
        let registry = Arc::new(
            AgentRegistry::new(
                broker.clone(),
                names.clone(),
                config.registry.clone(),
                config.routing.clone(),
            )
            .with_retry(RetryPolicy::none()),
        );
        let executor = Arc::new(ScriptedExecutor {
            fail,
            calls: AtomicUsize::new(0),
        });
        let deps = WorkflowDeps {
            safety: safety.clone(),
            registry,
            streams: Arc::new(
                BrokerStreamController::new(
                    broker.clone(),
                    names.clone(),
                    config.agent_id.clone(),
                    config.workflow.broker_read_timeout(),
                )
                .with_retry(RetryPolicy::none()),
            ),
            tasks: Arc::new(
                BrokerTaskTracker::new(broker, names, config.agent_id.clone())
                    .with_retry(RetryPolicy::none()),
            ),
            executor: executor.clone(),
        };
        let agent = AgentInfo::new(config.agent_id.clone(), "builder", ["developer"]);
        (WorkflowStateMachine::new(config, agent, deps), executor, safety)
    }

    async fn send(broker: &InMemoryBroker, message: CoordinationMessage) {
        broker
            .append("nova.coordination.nova-1", message.to_fields())
            .await
            .unwrap();
    }

    fn task_request(task_id: &str, priority: Priority) -> CoordinationMessage {
        CoordinationMessage::new(MessageType::TaskRequest)
            .sent_by("nova-0")
            .with_priority(priority)
            .with_payload(json!({ "task_id": task_id, "title": "Build it" }))
    }

    #[tokio::test]
    async fn test_initialization_registers_and_moves_to_stream_check() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);

        assert_eq!(machine.state(), WorkflowState::Initializing);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::StreamCheck);
        assert!(broker
            .set_members("nova.registry.active")
            .await
            .unwrap()
            .contains(&"nova-1".to_string()));
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_high_priority_request_reaches_task_execution() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, executor, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(&broker, task_request("t-42", Priority::High)).await;
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::WorkDiscovery);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::TaskExecution);
        assert_eq!(broker.len("nova.tasks.nova-1").await.unwrap(), 1);

        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::ProgressUpdate);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.len("nova.tasks.nova-1.history").await.unwrap(), 1);
        assert_eq!(
            machine.execute_cycle().await.unwrap(),
            WorkflowState::CompletionRoutine
        );
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_low_priority_request_is_queued_directly() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(&broker, task_request("t-1", Priority::Normal)).await;
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::TaskExecution);
        assert_eq!(broker.len("nova.tasks.nova-1").await.unwrap(), 1);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_mode_suppresses_queued_work() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(&broker, task_request("t-1", Priority::Low)).await;
        send(
            &broker,
            CoordinationMessage::control(crate::types::ControlCommand::Manual, "operator"),
        )
        .await;

        assert_eq!(
            machine.execute_cycle().await.unwrap(),
            WorkflowState::CompletionRoutine
        );
        assert_eq!(machine.mode(), OperatingMode::Manual);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_task_does_not_starve_stream_checks() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, executor, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(
            &broker,
            CoordinationMessage::new(MessageType::TaskRequest)
                .with_priority(Priority::Low)
                .with_payload(json!({
                    "task_id": "t-blocked",
                    "dependencies": ["t-on-other-agent"],
                })),
        )
        .await;
        assert_eq!(
            machine.execute_cycle().await.unwrap(),
            WorkflowState::CompletionRoutine
        );

        send(
            &broker,
            CoordinationMessage::control(crate::types::ControlCommand::Manual, "operator"),
        )
        .await;
        let mut stream_checks = 0;
        for _ in 0..20 {
            if machine.state() == WorkflowState::StreamCheck {
                stream_checks += 1;
            }
            let next = machine.execute_cycle().await.unwrap();
            assert_ne!(next, WorkflowState::TaskExecution);
        }

        assert!(stream_checks >= 5);
        assert_eq!(machine.mode(), OperatingMode::Manual);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.len("nova.tasks.nova-1").await.unwrap(), 1);
        assert_eq!(broker.len("nova.tasks.nova-1.history").await.unwrap(), 0);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_parameter_change_reconfigures_safety() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(
            &broker,
            CoordinationMessage::new(MessageType::ParameterChange)
                .with_priority(Priority::Critical)
                .with_payload(json!({
                    "param_type": "safety",
                    "param_name": "max_consecutive_errors",
                    "value": 2,
                })),
        )
        .await;
        send(
            &broker,
            CoordinationMessage::new(MessageType::ParameterChange).with_payload(json!({
                "param_type": "safety",
                "param_name": "max_consecutive_errors",
                "value": 999,
            })),
        )
        .await;
        machine.execute_cycle().await.unwrap();

        assert_eq!(machine.config().safety.max_consecutive_errors, 2);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_interval_change_reaches_registry() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(
            &broker,
            CoordinationMessage::new(MessageType::ParameterChange).with_payload(json!({
                "param_type": "registry",
                "param_name": "heartbeat_interval_secs",
                "value": 5,
            })),
        )
        .await;
        machine.execute_cycle().await.unwrap();

        assert_eq!(machine.config().registry.heartbeat_interval_secs, 5);
        assert_eq!(
            machine.registry.heartbeat_interval(),
            Duration::from_secs(5)
        );
        assert!(machine.registry.heartbeat_running("nova-1").await);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_consecutive_failures_route_to_error_recovery() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, executor, safety) =
            create_test_machine(broker.clone(), create_test_config(), true);
        machine.execute_cycle().await.unwrap();

        for i in 0..8 {
            send(&broker, task_request(&format!("t-{}", i), Priority::Normal)).await;
        }

        let mut reached = false;
        for _ in 0..30 {
            let next = machine.execute_cycle().await.unwrap();
            if next == WorkflowState::ErrorRecovery {
                reached = true;
                break;
            }
        }
        assert!(reached);
        assert!(executor.calls.load(Ordering::SeqCst) <= 5);
        assert_eq!(safety.assess().consecutive_errors, 0);

        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::StreamCheck);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_dangerous_command_is_refused() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, executor, safety) =
            create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        send(
            &broker,
            CoordinationMessage::new(MessageType::TaskRequest).with_payload(json!({
                "task_id": "t-loop",
                "command": "while true; do claude -p go; done",
            })),
        )
        .await;
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::TaskExecution);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::ProgressUpdate);

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        let status = safety.get_comprehensive_safety_status();
        assert_eq!(status.violation_counts["DANGEROUS_CONTENT"], 1);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_broker_outage_is_a_no_op_advance() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();

        broker.set_available(false);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::StreamCheck);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::StreamCheck);

        broker.set_available(true);
        assert_eq!(
            machine.execute_cycle().await.unwrap(),
            WorkflowState::CompletionRoutine
        );
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_for_missing_capability_is_forwarded() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut machine, _, _) = create_test_machine(broker.clone(), create_test_config(), false);
        machine.execute_cycle().await.unwrap();
        machine
            .registry
            .register(AgentInfo::new("nova-2", "qa", ["tester"]))
            .await
            .unwrap();

        send(
            &broker,
            CoordinationMessage::new(MessageType::TaskRequest)
                .with_priority(Priority::High)
                .with_payload(json!({ "task_id": "t-qa", "capability": "tester" })),
        )
        .await;
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::WorkDiscovery);
        assert_eq!(
            machine.execute_cycle().await.unwrap(),
            WorkflowState::PhaseTransition
        );
        assert_eq!(broker.len("nova.tasks.nova-2").await.unwrap(), 1);
        assert_eq!(broker.len("nova.tasks.nova-1").await.unwrap(), 0);
        machine.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_pause_resumes_when_safe() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut config = create_test_config();
        config.workflow.audit_capacity = 3;
        let (mut machine, _, _) = create_test_machine(broker, config, false);
        machine.execute_cycle().await.unwrap();

        machine.force_safety_pause("test");
        assert_eq!(machine.state(), WorkflowState::SafetyPause);
        assert_eq!(machine.execute_cycle().await.unwrap(), WorkflowState::StreamCheck);

        for _ in 0..5 {
            machine.execute_cycle().await.unwrap();
        }
        assert_eq!(machine.audit().len(), 3);
        assert_eq!(machine.subscribe().borrow().cycle_count, machine.cycle_count());
        machine.registry.shutdown().await;
    }
}
