//! Plan / PlanResult: the ephemeral request/response pair between the
//! scheduler and the [`crate::services::plan_applier::PlanApplier`]. Never
//! persisted directly — only the allocations and deployment updates it
//! describes are written to the `StateStore`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::allocation::Allocation;
use super::ids::{AllocId, DeploymentId, EvalId, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocUpdate {
    pub alloc_id: AllocId,
    pub desired_description: String,
    /// `true` for a migrate-driven stop (the alloc's replacement is being
    /// placed elsewhere), `false` for preemption/eviction.
    pub evict: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    pub deployment_id: DeploymentId,
    pub placed_delta: HashMap<String, u32>,
}

/// A plan, as constructed by the scheduler (§4.4 Phase D). `node_allocations`
/// and `node_updates` are keyed by target node so the applier can process
/// them per-node with a single optimistic resource check per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub priority: u8,
    /// If true and any placement in the plan is dropped at apply time, the
    /// whole plan's placements are dropped (stops still commit).
    pub all_at_once: bool,
    pub node_allocations: HashMap<NodeId, Vec<Allocation>>,
    pub node_updates: HashMap<NodeId, Vec<AllocUpdate>>,
    pub node_preemptions: HashMap<NodeId, Vec<AllocUpdate>>,
    pub deployment_updates: Vec<DeploymentUpdate>,
}

impl Plan {
    #[must_use]
    pub fn new(eval_id: EvalId, priority: u8, all_at_once: bool) -> Self {
        Self {
            eval_id,
            priority,
            all_at_once,
            ..Default::default()
        }
    }

    pub fn place(&mut self, node_id: NodeId, alloc: Allocation) {
        self.node_allocations.entry(node_id).or_default().push(alloc);
    }

    pub fn stop(&mut self, node_id: NodeId, update: AllocUpdate) {
        self.node_updates.entry(node_id).or_default().push(update);
    }

    pub fn preempt(&mut self, node_id: NodeId, update: AllocUpdate) {
        self.node_preemptions.entry(node_id).or_default().push(update);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node_allocations.values().all(Vec::is_empty)
            && self.node_updates.values().all(Vec::is_empty)
            && self.node_preemptions.values().all(Vec::is_empty)
    }
}

/// Subset of a [`Plan`] actually committed after the applier's optimistic
/// resource check (§4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResult {
    pub index: u64,
    pub accepted: Vec<AllocId>,
    pub dropped: Vec<AllocId>,
    /// True if the whole plan was rejected because `all_at_once` tripped.
    pub all_at_once_rejected: bool,
}
