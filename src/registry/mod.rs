pub mod directory;
pub mod heartbeat;
pub mod routing;

pub use directory::AgentRegistry;
pub use heartbeat::HeartbeatHandle;
pub use routing::{score_agent, ScoredAgent};
