use serde::{Deserialize, Serialize};

use crate::config::RoutingWeights;
use crate::types::{AgentId, AgentInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub agent_id: AgentId,
    pub score: f64,
    pub has_capability: bool,
    pub queue_length: usize,
    pub success_rate: f64,
}

/// `w_c * [has capability] - w_q * queue length + w_s * success rate`
pub fn score_agent(
    agent: &AgentInfo,
    task_kind: &str,
    queue_length: usize,
    weights: &RoutingWeights,
) -> ScoredAgent {
    let has_capability = agent.has_capability(task_kind);
    let success_rate = agent.performance.success_rate();
    let capability_term = if has_capability {
        weights.capability_weight
    } else {
        0.0
    };

    ScoredAgent {
        agent_id: agent.agent_id.clone(),
        score: capability_term - weights.queue_weight * queue_length as f64
            + weights.success_weight * success_rate,
        has_capability,
        queue_length,
        success_rate,
    }
}

/// Best first; equal scores fall back to agent id order.
pub fn sort_ranked(scored: &mut [ScoredAgent]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
}
