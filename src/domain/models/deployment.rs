//! Deployment: tracks one job-version transition for one job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DeploymentId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Paused,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupDeploymentState {
    pub placed_allocs: u32,
    pub healthy_allocs: u32,
    pub unhealthy_allocs: u32,
    pub placed_canaries: u32,
    pub desired_canaries: u32,
    pub desired_total: u32,
    pub promoted: bool,
    pub auto_revert: bool,
    pub progress_deadline_secs: u64,
    /// Reset to `now + progress_deadline` on every transition-to-healthy.
    pub deadline_at: Option<DateTime<Utc>>,
}

impl TaskGroupDeploymentState {
    #[must_use]
    pub fn new(desired_total: u32, desired_canaries: u32, auto_revert: bool, progress_deadline_secs: u64) -> Self {
        Self {
            placed_allocs: 0,
            healthy_allocs: 0,
            unhealthy_allocs: 0,
            placed_canaries: 0,
            desired_canaries,
            desired_total,
            promoted: desired_canaries == 0,
            auto_revert,
            progress_deadline_secs,
            deadline_at: None,
        }
    }

    #[must_use]
    pub const fn is_healthy_complete(&self) -> bool {
        !self.promoted && self.healthy_allocs >= self.desired_canaries
            || self.promoted && self.healthy_allocs >= self.desired_total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub job_id: JobId,
    pub job_version: u64,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub task_groups: HashMap<String, TaskGroupDeploymentState>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Deployment {
    #[must_use]
    pub fn new(id: DeploymentId, job_id: JobId, job_version: u64, create_index: u64) -> Self {
        Self {
            id,
            job_id,
            job_version,
            status: DeploymentStatus::Running,
            status_description: String::new(),
            task_groups: HashMap::new(),
            create_index,
            modify_index: create_index,
        }
    }

    #[must_use]
    pub fn all_groups_promoted_and_healthy(&self) -> bool {
        !self.task_groups.is_empty()
            && self
                .task_groups
                .values()
                .all(|g| g.promoted && g.healthy_allocs >= g.desired_total)
    }
}
