//! Allocation: the placement of one task group of one job version on one node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AllocId, DeploymentId, JobId, NodeId};
use super::job::{DelayFunction, ResourceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentHealth {
    Unset,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAllocStatus {
    pub health: DeploymentHealth,
    pub healthy_since: Option<DateTime<Utc>>,
    pub canary: bool,
}

impl Default for DeploymentAllocStatus {
    fn default() -> Self {
        Self {
            health: DeploymentHealth::Unset,
            healthy_since: None,
            canary: false,
        }
    }
}

/// One entry in an allocation's reschedule history, used to derive the next
/// eligible reschedule time per spec.md §4.8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub time: DateTime<Utc>,
    pub delay_secs: u64,
    pub prev_alloc_id: AllocId,
    pub prev_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RescheduleTracker {
    pub events: Vec<RescheduleEvent>,
}

impl RescheduleTracker {
    /// Number of reschedule attempts within `interval_secs` of `now`
    /// (spec.md §4.8: `attemptsUsed = count(events with time >= now-interval)`).
    #[must_use]
    pub fn attempts_used(&self, now: DateTime<Utc>, interval_secs: u64) -> u32 {
        let cutoff = now - chrono::Duration::seconds(interval_secs as i64);
        self.events.iter().filter(|e| e.time >= cutoff).count() as u32
    }

    #[must_use]
    pub fn last_event(&self) -> Option<&RescheduleEvent> {
        self.events.last()
    }
}

/// Per-allocation scheduler placement explanation, surfaced on blocked evals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocMetrics {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_exhausted: Vec<String>,
    pub class_exhausted: std::collections::HashMap<String, u32>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Terminated { success: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub job_id: JobId,
    pub job_version: u64,
    pub task_group: String,
    pub node_id: NodeId,
    pub desired_status: DesiredStatus,
    pub desired_description: String,
    pub client_status: ClientStatus,
    pub deployment_id: Option<DeploymentId>,
    pub deployment_status: DeploymentAllocStatus,
    pub previous_allocation: Option<AllocId>,
    pub next_allocation: Option<AllocId>,
    pub reschedule_tracker: RescheduleTracker,
    pub metrics: AllocMetrics,
    pub resources: ResourceRequest,
    pub assigned_ports: Vec<u16>,
    pub task_state: TaskState,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.client_status.is_terminal()
            && matches!(self.desired_status, DesiredStatus::Stop | DesiredStatus::Evict)
    }

    #[must_use]
    pub fn is_running_or_pending(&self) -> bool {
        !self.client_status.is_terminal() && self.desired_status == DesiredStatus::Run
    }

    /// `earliestReschedule = lastEvent.time + computedDelay(...)`, spec.md §4.8.
    #[must_use]
    pub fn earliest_reschedule_time(
        &self,
        base_time: DateTime<Utc>,
        delay_secs: u64,
        function: DelayFunction,
        max_delay_secs: u64,
    ) -> DateTime<Utc> {
        let attempt = self.reschedule_tracker.events.len() as u32;
        let delay = compute_delay(attempt, delay_secs, function, max_delay_secs);
        base_time + chrono::Duration::seconds(delay as i64)
    }
}

/// `DelayFunction` evaluation, shared between the reschedule tracker and the
/// reconciler. `attempt` is the zero-based count of prior reschedule events.
#[must_use]
pub fn compute_delay(attempt: u32, base_delay_secs: u64, function: DelayFunction, max_delay_secs: u64) -> u64 {
    let raw = match function {
        DelayFunction::Constant => base_delay_secs,
        DelayFunction::Exponential => base_delay_secs.saturating_mul(1u64 << attempt.min(32)),
        DelayFunction::Fibonacci => base_delay_secs.saturating_mul(fibonacci(attempt + 1)),
    };
    raw.min(max_delay_secs)
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_each_attempt_until_capped() {
        assert_eq!(compute_delay(0, 5, DelayFunction::Exponential, 3600), 5);
        assert_eq!(compute_delay(1, 5, DelayFunction::Exponential, 3600), 10);
        assert_eq!(compute_delay(2, 5, DelayFunction::Exponential, 3600), 20);
        assert_eq!(compute_delay(10, 5, DelayFunction::Exponential, 3600), 3600);
    }

    #[test]
    fn constant_delay_never_grows() {
        for attempt in 0..5 {
            assert_eq!(compute_delay(attempt, 30, DelayFunction::Constant, 3600), 30);
        }
    }

    #[test]
    fn fibonacci_delay_follows_sequence() {
        assert_eq!(compute_delay(0, 1, DelayFunction::Fibonacci, 3600), 1);
        assert_eq!(compute_delay(1, 1, DelayFunction::Fibonacci, 3600), 1);
        assert_eq!(compute_delay(2, 1, DelayFunction::Fibonacci, 3600), 2);
        assert_eq!(compute_delay(3, 1, DelayFunction::Fibonacci, 3600), 3);
        assert_eq!(compute_delay(4, 1, DelayFunction::Fibonacci, 3600), 5);
    }
}
