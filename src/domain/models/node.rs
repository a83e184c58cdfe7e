//! Node: a worker registered in the fleet.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;
use super::job::ResourceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Initializing,
    Ready,
    Down,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    Eligible,
    Ineligible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverHealth {
    pub healthy: bool,
    pub detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// Inclusive port range available for dynamic allocation.
    pub dynamic_port_min: u16,
    pub dynamic_port_max: u16,
}

impl NodeResources {
    #[must_use]
    pub fn fits(&self, reserved: &NodeResources, used: &ResourceRequest, want: &ResourceRequest) -> bool {
        self.cpu_mhz.saturating_sub(reserved.cpu_mhz) >= used.cpu_mhz + want.cpu_mhz
            && self.memory_mb.saturating_sub(reserved.memory_mb) >= used.memory_mb + want.memory_mb
            && self.disk_mb.saturating_sub(reserved.disk_mb) >= used.disk_mb + want.disk_mb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStrategy {
    /// Past this point every remaining allocation is force-stopped
    /// regardless of `force_deadline` or migrate policy.
    pub deadline: DateTime<Utc>,
    pub ignore_system_jobs: bool,
    /// Skip graceful migration and force-stop immediately, without waiting
    /// for `deadline`.
    pub force_deadline: bool,
    /// Restore eligibility automatically once the drain completes.
    pub mark_eligible_on_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub datacenter: String,
    pub class: String,
    pub attributes: HashMap<String, String>,
    pub resources: NodeResources,
    pub reserved: NodeResources,
    pub drivers: HashMap<String, DriverHealth>,
    pub status: NodeStatus,
    pub scheduling_eligibility: SchedulingEligibility,
    pub drain_strategy: Option<DrainStrategy>,
    pub last_heartbeat: DateTime<Utc>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Node {
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready && self.scheduling_eligibility == SchedulingEligibility::Eligible
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain_strategy.is_some()
    }

    /// TTL-based liveness check; a node whose heartbeat is older than `ttl`
    /// has *not yet* transitioned to `down` in the store but should be
    /// treated as not-ready by anything computing it live (spec open
    /// question #2: transitions are driven by explicit TTL expiry, not by
    /// scheduler-side inference).
    #[must_use]
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, ttl_secs: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > ttl_secs
    }
}
