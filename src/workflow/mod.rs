pub mod collaborators;
pub mod state_machine;

pub use collaborators::{
    BrokerStreamController, BrokerTaskTracker, InboundMessage, ShellExecutor, StreamController,
    TaskExecutor, TaskTracker,
};
pub use state_machine::{WorkflowDeps, WorkflowStateMachine};
