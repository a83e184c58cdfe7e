//! Job and TaskGroup: immutable-per-version user intent.
//!
//! A [`Job`] gets a new monotone [`Job::version`] on every update; prior
//! versions are never rewritten, only superseded (see spec invariant: "Every
//! Allocation references an extant Job version").

use serde::{Deserialize, Serialize};

use super::ids::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
    PeriodicParent,
    ParameterizedParent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: String,
    pub region: String,
    pub job_type: JobType,
    /// 1-100, higher runs/preempts first.
    pub priority: u8,
    pub datacenters: Vec<String>,
    pub groups: Vec<TaskGroup>,
    /// Monotone per id; bumped on every `RegisterJob` that changes the spec.
    pub version: u64,
    /// Marked true once a deployment of this version has gone `successful`;
    /// used as the auto-revert target.
    pub stable: bool,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Job {
    #[must_use]
    pub fn total_count(&self) -> u32 {
        self.groups.iter().map(|g| g.count).sum()
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub spreads: Vec<Spread>,
    pub resources: ResourceRequest,
    pub restart: RestartPolicy,
    pub reschedule: ReschedulePolicy,
    pub migrate: MigratePolicy,
    pub update: UpdatePolicy,
    pub ephemeral_disk: EphemeralDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// Number of dynamic ports the group needs assigned from the node pool.
    pub network_ports: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Regexp,
    SetContains,
    Version,
    DistinctHosts,
    DistinctProperty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Node attribute path this constraint inspects, e.g. `${attr.cpu.arch}`.
    /// Empty for `distinct_hosts`, which takes no attribute.
    pub l_target: String,
    pub operator: ConstraintOperator,
    pub r_target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub l_target: String,
    pub operator: ConstraintOperator,
    pub r_target: String,
    /// -100..=100
    pub weight: i8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub attribute: String,
    /// (attribute value, target percent 0-100); empty means spread evenly.
    pub targets: Vec<(String, u8)>,
    pub weight: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub attempts: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    Constant,
    Exponential,
    Fibonacci,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub attempts: u32,
    pub interval_secs: u64,
    pub delay_secs: u64,
    pub delay_function: DelayFunction,
    pub max_delay_secs: u64,
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            interval_secs: 3600,
            delay_secs: 30,
            delay_function: DelayFunction::Exponential,
            max_delay_secs: 3600,
            unlimited: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MigratePolicy {
    pub max_parallel: u32,
    pub health_check_secs: u64,
}

impl Default for MigratePolicy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub max_parallel: u32,
    pub canary: u32,
    pub min_healthy_time_secs: u64,
    pub healthy_deadline_secs: u64,
    pub progress_deadline_secs: u64,
    pub auto_revert: bool,
    pub auto_promote: bool,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            canary: 0,
            min_healthy_time_secs: 10,
            healthy_deadline_secs: 300,
            progress_deadline_secs: 600,
            auto_revert: false,
            auto_promote: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralDiskMode {
    Fresh,
    Sticky,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EphemeralDisk {
    pub size_mb: u64,
    pub mode: EphemeralDiskMode,
}

impl Default for EphemeralDisk {
    fn default() -> Self {
        Self {
            size_mb: 300,
            mode: EphemeralDiskMode::Fresh,
        }
    }
}
