pub mod monitor;

pub use monitor::{AlertCounter, MessageHandler, StreamMonitor};

use anyhow::Result;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::registry::AgentRegistry;
use crate::safety::SafetyOrchestrator;
use crate::shutdown::Shutdown;
use crate::types::{EventType, ViolationKind, WorkflowSnapshot, WorkflowState};
use crate::workflow::WorkflowStateMachine;

/// What one supervised cycle did besides stepping the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub state: WorkflowState,
    pub coordination_checked: bool,
    pub metrics_published: bool,
}

/// Drives a [`WorkflowStateMachine`] forever, sleeping adaptively between
/// cycles. Errors and panics from a cycle never end the loop; they pause
/// the machine instead.
pub struct Supervisor {
    machine: WorkflowStateMachine,
    safety: Arc<SafetyOrchestrator>,
    registry: Arc<AgentRegistry>,
    cycles: u64,
}

impl Supervisor {
    pub fn new(
        machine: WorkflowStateMachine,
        safety: Arc<SafetyOrchestrator>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            machine,
            safety,
            registry,
            cycles: 0,
        }
    }

    pub fn machine(&self) -> &WorkflowStateMachine {
        &self.machine
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<WorkflowSnapshot> {
        self.machine.subscribe()
    }

    /// Runs until `shutdown` fires, then unregisters the agent. Returns the
    /// number of cycles executed.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<u64> {
        log::info!(
            "Supervising {} from {}",
            self.machine.agent().agent_id,
            self.machine.state()
        );

        while !shutdown.is_triggered() {
            let report = self.run_cycle().await;
            let pause = self.machine.sleep_for(report.state);
            if !shutdown.sleep(pause).await {
                break;
            }
        }

        log::info!("Shutdown requested after {} cycle(s)", self.cycles);
        self.stop().await;
        Ok(self.cycles)
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        if !self.safety.is_safe_to_proceed() {
            log::debug!("Cycle {} starts under an unsafe assessment", self.cycles);
        }

        let outcome = AssertUnwindSafe(self.machine.execute_cycle())
            .catch_unwind()
            .await;
        let state = match outcome {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => self.escalate(&e.to_string()),
            Err(panic) => self.escalate(&format!("cycle panicked: {}", panic_message(&*panic))),
        };

        let workflow = &self.machine.config().workflow;
        let check_due = self.cycles % workflow.coordination_check_every == 0;
        let metrics_due = self.cycles % workflow.metrics_every == 0;

        if check_due {
            self.coordination_check().await;
        }
        let metrics_published = metrics_due && self.publish_metrics().await;

        CycleReport {
            cycle: self.cycles,
            state,
            coordination_checked: check_due,
            metrics_published,
        }
    }

    fn escalate(&mut self, reason: &str) -> WorkflowState {
        log::error!("Cycle {} failed: {}", self.cycles, reason);
        self.safety.handle_safety_violation(
            ViolationKind::CriticalError,
            json!({ "description": reason, "cycle": self.cycles }),
        );
        self.machine.force_safety_pause(reason);
        WorkflowState::SafetyPause
    }

    async fn coordination_check(&self) {
        let agent_id = &self.machine.agent().agent_id;
        match self.registry.discover(None).await {
            Ok(live) => log::info!(
                "Coordination check: {} live agent(s), {} in {}",
                live.len(),
                agent_id,
                self.machine.state()
            ),
            Err(e) => log::warn!("Coordination check failed: {}", e),
        }
        if let Err(e) = self.registry.touch(agent_id).await {
            log::warn!("Could not refresh heartbeat for {}: {}", agent_id, e);
        }
    }

    async fn publish_metrics(&self) -> bool {
        let status = self.safety.get_comprehensive_safety_status();
        let payload = json!({
            "cycle": self.cycles,
            "state": self.machine.state(),
            "mode": self.machine.mode(),
            "tasks_completed_in_phase": self.machine.tasks_completed_in_phase(),
            "safety": status,
        });
        match self
            .registry
            .broadcast(&self.machine.agent().agent_id, EventType::MetricsUpdate, payload)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Could not publish metrics: {}", e);
                false
            }
        }
    }

    async fn stop(&self) {
        let agent_id = &self.machine.agent().agent_id;
        if let Err(e) = self.registry.unregister(agent_id).await {
            log::warn!("Could not unregister {}: {}", agent_id, e);
        }
        self.registry.shutdown().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, RetryPolicy, StreamNames};
    use crate::config::{Config, StateSleeps};
    use crate::types::{AgentInfo, TaskSpec};
    use crate::workflow::{
        BrokerStreamController, BrokerTaskTracker, TaskExecutor, WorkflowDeps,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(&self, _task: &TaskSpec) -> anyhow::Result<String> {
            panic!("executor exploded");
        }
    }

    fn create_test_supervisor(broker: Arc<InMemoryBroker>) -> Supervisor {
        let mut config = Config::default();
        config.agent_id = "nova-1".into();
        config.workflow.broker_read_timeout_ms = 5;
        config.workflow.sleep = StateSleeps::zero();

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
        let deps = WorkflowDeps {
            safety: safety.clone(),
            registry: registry.clone(),
            streams: Arc::new(BrokerStreamController::new(
                broker.clone(),
                names.clone(),
                "nova-1",
                config.workflow.broker_read_timeout(),
            )),
            tasks: Arc::new(BrokerTaskTracker::new(broker, names, "nova-1")),
            executor: Arc::new(PanickingExecutor),
        };
        let agent = AgentInfo::new("nova-1", "builder", ["developer"]);
        Supervisor::new(WorkflowStateMachine::new(config, agent, deps), safety, registry)
    }

    #[tokio::test]
    async fn test_periodic_work_follows_cycle_count() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut supervisor = create_test_supervisor(broker.clone());

        let mut checks = Vec::new();
        let mut metrics = Vec::new();
        for _ in 0..12 {
            let report = supervisor.run_cycle().await;
            if report.coordination_checked {
                checks.push(report.cycle);
            }
            if report.metrics_published {
                metrics.push(report.cycle);
            }
        }
        assert_eq!(checks, vec![5, 10]);
        assert_eq!(metrics, vec![10]);
        supervisor.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_cycle_pauses_instead_of_crashing() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut supervisor = create_test_supervisor(broker.clone());
        supervisor.run_cycle().await;

        broker
            .append(
                "nova.coordination.nova-1",
                crate::types::CoordinationMessage::new(crate::types::MessageType::TaskRequest)
                    .with_payload(json!({ "task_id": "t-1" }))
                    .to_fields(),
            )
            .await
            .unwrap();

        let mut last = WorkflowState::Initializing;
        for _ in 0..3 {
            last = supervisor.run_cycle().await.state;
        }
        assert_eq!(last, WorkflowState::SafetyPause);
        assert!(!supervisor.safety.is_safe_to_proceed());
        assert_eq!(supervisor.run_cycle().await.state, WorkflowState::SafetyPause);
        supervisor.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_and_unregisters_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut supervisor = create_test_supervisor(broker.clone());
        let (tx, shutdown) = crate::shutdown::channel();

        let handle = tokio::spawn(async move {
            let cycles = supervisor.run(shutdown).await.unwrap();
            (cycles, supervisor)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let (cycles, supervisor) = handle.await.unwrap();
        assert!(cycles >= 1);
        assert!(!supervisor.registry.heartbeat_running("nova-1").await);
        assert!(broker
            .set_members("nova.registry.active")
            .await
            .unwrap()
            .is_empty());
    }
}
