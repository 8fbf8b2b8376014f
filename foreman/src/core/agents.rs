//! Capability-based agent selection.

use crate::core::types::{Capabilities, Tier};

/// Executor descriptor used for selection. Immutable configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub id: String,
    pub capabilities: Capabilities,
    /// When set, the agent only serves issues carrying at least one of these tags.
    pub allowed_tags: Option<Vec<String>>,
    pub tier: Option<Tier>,
    /// Higher wins.
    pub priority: i64,
}

/// Optional predicates narrowing selection beyond capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionConstraints {
    pub tags: Vec<String>,
    pub tier: Option<Tier>,
    pub pinned_agent: Option<String>,
}

/// Agents in registration order.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentDescriptor>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    /// Pick the highest-priority agent whose capabilities cover `required`.
    ///
    /// Ties go to the agent registered first. Returns `None` when nothing
    /// qualifies; the caller decides how to react.
    pub fn select(
        &self,
        required: &Capabilities,
        constraints: &SelectionConstraints,
    ) -> Option<&AgentDescriptor> {
        let mut best: Option<&AgentDescriptor> = None;
        for agent in self
            .agents
            .iter()
            .filter(|agent| agent.capabilities.is_superset(required))
            .filter(|agent| satisfies(agent, constraints))
        {
            // Strict comparison keeps the earliest agent on equal priority.
            if best.is_none_or(|current| agent.priority > current.priority) {
                best = Some(agent);
            }
        }
        best
    }
}

fn satisfies(agent: &AgentDescriptor, constraints: &SelectionConstraints) -> bool {
    if let Some(pinned) = &constraints.pinned_agent
        && &agent.id != pinned
    {
        return false;
    }
    if let Some(tier) = constraints.tier
        && agent.tier != Some(tier)
    {
        return false;
    }
    match &agent.allowed_tags {
        None => true,
        Some(allowed) => allowed.iter().any(|tag| constraints.tags.contains(tag)),
    }
}
