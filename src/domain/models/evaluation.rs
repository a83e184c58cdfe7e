//! Evaluation: the unit of scheduling work.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::allocation::AllocMetrics;
use super::ids::{EvalId, JobId, NodeId};
use super::job::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    JobRegister,
    JobDeregister,
    PeriodicJob,
    NodeUpdate,
    NodeDrain,
    AllocStop,
    Scheduled,
    RollingUpdate,
    DeploymentWatcher,
    FailedFollowUp,
    MaxPlanAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

/// A coarse feasibility fingerprint: the set of node classes the scheduler
/// inspected while filtering, used to avoid thundering-herd unblocking
/// (spec.md §4.2, §9 "Blocked-eval unblocking").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEligibility(pub BTreeSet<String>);

impl ClassEligibility {
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.0.iter().any(|c| other.0.contains(c))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedTGAlloc {
    pub task_group: String,
    pub metrics: AllocMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    /// 1-100, inherited from the job at creation time.
    pub priority: u8,
    pub job_type: JobType,
    pub namespace: String,
    pub triggered_by: TriggeredBy,
    pub job_id: JobId,
    pub job_modify_index: u64,
    pub node_id: Option<NodeId>,
    pub status: EvalStatus,
    pub status_description: String,
    pub wait_until: Option<DateTime<Utc>>,
    pub previous_eval: Option<EvalId>,
    pub next_eval: Option<EvalId>,
    pub blocked_eval: Option<EvalId>,
    pub failed_tg_allocs: Vec<FailedTGAlloc>,
    pub class_eligibility: ClassEligibility,
    pub snapshot_index: Option<u64>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Evaluation {
    #[must_use]
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.wait_until.is_some_and(|t| t > now)
    }
}
