use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{retry_transient, Broker, EntryId, RetryPolicy, StreamEntry, StreamNames};
use crate::error::BrokerError;
use crate::types::{AgentId, CoordinationMessage, EcosystemEvent, EventType, TaskId, TaskRecord, TaskSpec};

/// A decoded coordination entry together with its broker id.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: EntryId,
    pub message: CoordinationMessage,
}

/// Coordination-log I/O on behalf of one agent.
#[async_trait]
pub trait StreamController: Send + Sync {
    /// Creates the consumer group on the agent's coordination log.
    async fn prepare(&self) -> Result<(), BrokerError>;
    /// Unacknowledged messages first, then new ones, at most `max` new.
    /// Malformed entries are acknowledged and skipped.
    async fn pending_messages(&self, max: usize) -> Result<Vec<InboundMessage>, BrokerError>;
    async fn acknowledge(&self, id: EntryId) -> Result<(), BrokerError>;
    async fn publish_event(&self, event_type: EventType, payload: Value) -> Result<EntryId, BrokerError>;
    async fn raise_alert(&self, message: &CoordinationMessage) -> Result<EntryId, BrokerError>;
}

/// Per-agent work queue.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// False when a task with the same id is already queued.
    async fn enqueue(&self, task: TaskSpec) -> Result<bool, BrokerError>;
    /// Places `task` on another agent's queue; false if already there.
    async fn forward(&self, agent_id: &str, task: TaskSpec) -> Result<bool, BrokerError>;
    /// Queued tasks without a completion record, in queue order.
    async fn pending(&self) -> Result<Vec<TaskSpec>, BrokerError>;
    /// Pending tasks whose dependencies all succeeded, in queue order.
    async fn ready(&self) -> Result<Vec<TaskSpec>, BrokerError>;
    async fn ready_len(&self) -> Result<usize, BrokerError> {
        Ok(self.ready().await?.len())
    }
    /// Highest priority ready task; queue order breaks ties.
    async fn next_ready(&self) -> Result<Option<TaskSpec>, BrokerError> {
        let mut best: Option<TaskSpec> = None;
        for task in self.ready().await? {
            if best.as_ref().map_or(true, |b| task.priority > b.priority) {
                best = Some(task);
            }
        }
        Ok(best)
    }
    async fn complete(&self, record: TaskRecord) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskSpec) -> Result<String>;
}

const PAGE: usize = 256;

async fn read_all(
    broker: &dyn Broker,
    retry: &RetryPolicy,
    stream: &str,
) -> Result<Vec<StreamEntry>, BrokerError> {
    let mut all = Vec::new();
    let mut after = None;
    loop {
        let page = retry_transient(retry, || broker.range(stream, after, PAGE)).await?;
        let done = page.len() < PAGE;
        after = page.last().map(|e| e.id).or(after);
        all.extend(page);
        if done {
            return Ok(all);
        }
    }
}

pub struct BrokerStreamController {
    broker: Arc<dyn Broker>,
    names: StreamNames,
    agent_id: AgentId,
    read_timeout: Duration,
    retry: RetryPolicy,
}

impl BrokerStreamController {
    pub fn new(
        broker: Arc<dyn Broker>,
        names: StreamNames,
        agent_id: impl Into<AgentId>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            names,
            agent_id: agent_id.into(),
            read_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn stream(&self) -> String {
        self.names.coordination(&self.agent_id)
    }

    fn group(&self) -> String {
        format!("{}-workflow", self.agent_id)
    }

    async fn decode(&self, entries: Vec<StreamEntry>) -> Result<Vec<InboundMessage>, BrokerError> {
        let stream = self.stream();
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match CoordinationMessage::from_fields(&stream, entry.id, &entry.fields) {
                Ok(message) => messages.push(InboundMessage {
                    id: entry.id,
                    message,
                }),
                Err(e) => {
                    log::warn!("Skipping coordination entry: {}", e);
                    self.acknowledge(entry.id).await?;
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl StreamController for BrokerStreamController {
    async fn prepare(&self) -> Result<(), BrokerError> {
        let (stream, group) = (self.stream(), self.group());
        retry_transient(&self.retry, || self.broker.ensure_group(&stream, &group)).await
    }

    async fn pending_messages(&self, max: usize) -> Result<Vec<InboundMessage>, BrokerError> {
        let (stream, group) = (self.stream(), self.group());
        let consumer = self.agent_id.as_str();

        let mut entries = retry_transient(&self.retry, || {
            self.broker.read_pending(&stream, &group, consumer)
        })
        .await?;
        let fresh = retry_transient(&self.retry, || {
            self.broker
                .read_group(&stream, &group, consumer, max, self.read_timeout)
        })
        .await?;
        entries.extend(fresh);

        self.decode(entries).await
    }

    async fn acknowledge(&self, id: EntryId) -> Result<(), BrokerError> {
        let (stream, group) = (self.stream(), self.group());
        retry_transient(&self.retry, || self.broker.ack(&stream, &group, id)).await
    }

    async fn publish_event(&self, event_type: EventType, payload: Value) -> Result<EntryId, BrokerError> {
        let stream = self.names.ecosystem_events();
        let fields = EcosystemEvent::new(event_type, self.agent_id.clone(), payload).to_fields();
        retry_transient(&self.retry, || self.broker.append(&stream, fields.clone())).await
    }

    async fn raise_alert(&self, message: &CoordinationMessage) -> Result<EntryId, BrokerError> {
        let stream = self.names.priority_alerts();
        let mut fields = message.to_fields();
        fields.insert("raised_by".into(), self.agent_id.clone());
        retry_transient(&self.retry, || self.broker.append(&stream, fields.clone())).await
    }
}

pub struct BrokerTaskTracker {
    broker: Arc<dyn Broker>,
    names: StreamNames,
    agent_id: AgentId,
    retry: RetryPolicy,
}

impl BrokerTaskTracker {
    pub fn new(broker: Arc<dyn Broker>, names: StreamNames, agent_id: impl Into<AgentId>) -> Self {
        Self {
            broker,
            names,
            agent_id: agent_id.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn queued(&self, agent_id: &str) -> Result<Vec<TaskSpec>, BrokerError> {
        let stream = self.names.tasks(agent_id);
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for entry in read_all(self.broker.as_ref(), &self.retry, &stream).await? {
            match TaskSpec::from_fields(&stream, entry.id, &entry.fields) {
                Ok(mut task) => {
                    if seen.insert(task.id.clone()) {
                        task.source_entry.get_or_insert(entry.id);
                        tasks.push(task);
                    }
                }
                Err(e) => log::warn!("Skipping task entry: {}", e),
            }
        }
        Ok(tasks)
    }

    /// Completion outcome per task id; the latest record wins.
    async fn outcomes(&self) -> Result<HashMap<TaskId, bool>, BrokerError> {
        let stream = self.names.task_history(&self.agent_id);
        let mut outcomes = HashMap::new();
        for entry in read_all(self.broker.as_ref(), &self.retry, &stream).await? {
            match TaskRecord::from_fields(&stream, entry.id, &entry.fields) {
                Ok(record) => {
                    outcomes.insert(record.task_id, record.outcome.is_success());
                }
                Err(e) => log::warn!("Skipping history entry: {}", e),
            }
        }
        Ok(outcomes)
    }

    async fn append_task(&self, agent_id: &str, task: TaskSpec) -> Result<bool, BrokerError> {
        if self.queued(agent_id).await?.iter().any(|t| t.id == task.id) {
            return Ok(false);
        }
        let stream = self.names.tasks(agent_id);
        let fields = task.to_fields();
        retry_transient(&self.retry, || self.broker.append(&stream, fields.clone())).await?;
        Ok(true)
    }
}

#[async_trait]
impl TaskTracker for BrokerTaskTracker {
    async fn enqueue(&self, task: TaskSpec) -> Result<bool, BrokerError> {
        let agent_id = self.agent_id.clone();
        self.append_task(&agent_id, task).await
    }

    async fn forward(&self, agent_id: &str, task: TaskSpec) -> Result<bool, BrokerError> {
        self.append_task(agent_id, task).await
    }

    async fn pending(&self) -> Result<Vec<TaskSpec>, BrokerError> {
        let outcomes = self.outcomes().await?;
        Ok(self
            .queued(&self.agent_id)
            .await?
            .into_iter()
            .filter(|t| !outcomes.contains_key(&t.id))
            .collect())
    }

    async fn ready(&self) -> Result<Vec<TaskSpec>, BrokerError> {
        let outcomes = self.outcomes().await?;
        Ok(self
            .queued(&self.agent_id)
            .await?
            .into_iter()
            .filter(|t| !outcomes.contains_key(&t.id))
            .filter(|t| {
                t.dependencies
                    .iter()
                    .all(|dep| outcomes.get(dep).copied().unwrap_or(false))
            })
            .collect())
    }

    async fn complete(&self, record: TaskRecord) -> Result<(), BrokerError> {
        let stream = self.names.task_history(&self.agent_id);
        let fields = record.to_fields();
        retry_transient(&self.retry, || self.broker.append(&stream, fields.clone())).await?;
        Ok(())
    }
}

/// Runs a task's shell command under `sh -c` with a hard timeout.
///
/// Tasks without a command are bookkeeping items and succeed immediately.
pub struct ShellExecutor {
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.trim_end().chars().collect();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect()
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &TaskSpec) -> Result<String> {
        let Some(command) = task.command.as_deref() else {
            return Ok(format!("{} has no command to run", task.id));
        };

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("task {} timed out after {:?}", task.id, self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            Ok(tail(&stdout, 2000))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                tail(&stderr, 500)
            ))
        }
    }
}
