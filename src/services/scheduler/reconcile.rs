//! Phase A — reconcile (spec.md §4.4). Diffs desired vs. actual allocations
//! for one job and classifies the delta into placements and stops.

use chrono::{DateTime, Utc};

use crate::domain::models::{
    compute_delay, Allocation, AllocId, DeploymentStatus, Job, NodeId, TaskGroup,
    TaskGroupDeploymentState,
};

#[derive(Debug, Clone)]
pub enum PlacementReason {
    New,
    Migrate { old: Allocation },
    DestructiveUpdate { old: Allocation },
    Canary { old: Allocation },
    Reschedule { old: Allocation },
}

#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub group: TaskGroup,
    pub reason: PlacementReason,
    /// Sticky-disk affinity: the predecessor's node, when the group's
    /// ephemeral disk mode is `sticky` (spec.md §4.4, §9).
    pub sticky_node: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct StopRequest {
    pub alloc: Allocation,
    pub evict: bool,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct GroupReconcile {
    pub placements: Vec<PlacementRequest>,
    pub stops: Vec<StopRequest>,
    /// Allocations whose reschedule is not yet due; carries the time to
    /// re-evaluate, for a `WaitUntil` follow-up eval.
    pub delayed: Vec<(AllocId, DateTime<Utc>)>,
    pub is_destructive: bool,
    pub canaries_placed_this_round: u32,
}

fn sticky_node(group: &TaskGroup, old: &Allocation) -> Option<NodeId> {
    use crate::domain::models::EphemeralDiskMode;
    (group.ephemeral_disk.mode == EphemeralDiskMode::Sticky).then(|| old.node_id.clone())
}

/// Reconciles one task group. `desired_count` is `group.count` for
/// service/batch jobs and the eligible-node count for system jobs — the
/// caller resolves that distinction (spec.md §4.4 "one per eligible node
/// for system").
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn reconcile_group(
    job: &Job,
    group: &TaskGroup,
    allocs: &[Allocation],
    desired_count: u32,
    deployment_state: Option<&TaskGroupDeploymentState>,
    draining_allocs: &[AllocId],
    now: DateTime<Utc>,
) -> GroupReconcile {
    let mut result = GroupReconcile::default();

    let mut current_ver: Vec<&Allocation> = allocs
        .iter()
        .filter(|a| a.task_group == group.name && a.job_version == job.version && a.is_running_or_pending())
        .collect();
    current_ver.sort_by_key(|a| a.create_index);

    let mut old_ver: Vec<&Allocation> = allocs
        .iter()
        .filter(|a| a.task_group == group.name && a.job_version != job.version && a.is_running_or_pending())
        .collect();
    old_ver.sort_by_key(|a| a.create_index);

    let failed: Vec<&Allocation> = current_ver
        .iter()
        .filter(|a| a.client_status == crate::domain::models::ClientStatus::Failed)
        .copied()
        .collect();
    let healthy_current: Vec<&Allocation> = current_ver
        .iter()
        .filter(|a| a.client_status != crate::domain::models::ClientStatus::Failed)
        .copied()
        .collect();

    // Migrate: current-version allocs on a draining node move, they do not
    // get stopped outright (spec.md §4.4 "Migrate").
    let draining: Vec<&Allocation> = healthy_current
        .iter()
        .filter(|a| draining_allocs.contains(&a.id))
        .copied()
        .collect();
    let migrate_budget = group.migrate.max_parallel as usize;
    for alloc in draining.iter().take(migrate_budget) {
        result.placements.push(PlacementRequest {
            group: group.clone(),
            reason: PlacementReason::Migrate { old: (**alloc).clone() },
            sticky_node: sticky_node(group, alloc),
        });
        result.stops.push(StopRequest {
            alloc: (**alloc).clone(),
            evict: false,
            description: "migrating off draining node".into(),
        });
    }

    // Reschedule: failed current-version allocs.
    for alloc in &failed {
        let policy = &group.reschedule;
        let attempts_used = alloc.reschedule_tracker.attempts_used(now, policy.interval_secs);
        if !policy.unlimited && attempts_used >= policy.attempts {
            result.stops.push(StopRequest {
                alloc: (*alloc).clone(),
                evict: false,
                description: "reschedule attempts exhausted".into(),
            });
            continue;
        }
        let base_time = alloc
            .reschedule_tracker
            .last_event()
            .map_or(now, |e| e.time);
        let delay = compute_delay(attempts_used, policy.delay_secs, policy.delay_function, policy.max_delay_secs);
        let earliest = base_time + chrono::Duration::seconds(delay as i64);
        if now >= earliest {
            result.placements.push(PlacementRequest {
                group: group.clone(),
                reason: PlacementReason::Reschedule { old: (*alloc).clone() },
                sticky_node: sticky_node(group, alloc),
            });
            result.stops.push(StopRequest {
                alloc: (*alloc).clone(),
                evict: false,
                description: "rescheduled".into(),
            });
        } else {
            result.delayed.push((alloc.id, earliest));
        }
    }

    // Destructive update: a prior job version still has live allocations.
    if !old_ver.is_empty() {
        if group.update.max_parallel == 0 {
            // Boundary behavior: no destructive replacements, nothing to do.
        } else {
            result.is_destructive = true;
            let canary_target = group.update.canary;
            let placed_canaries = deployment_state.map_or(0, |d| d.placed_canaries);
            let promoted = deployment_state.map_or(canary_target == 0, |d| d.promoted);

            if placed_canaries < canary_target {
                let remaining = (canary_target - placed_canaries) as usize;
                for alloc in old_ver.iter().take(remaining) {
                    result.placements.push(PlacementRequest {
                        group: group.clone(),
                        reason: PlacementReason::Canary { old: (**alloc).clone() },
                        sticky_node: None,
                    });
                    result.canaries_placed_this_round += 1;
                }
            } else if promoted {
                let in_flight = deployment_state.map_or(0, |d| d.placed_allocs.saturating_sub(d.healthy_allocs));
                let budget = (group.update.max_parallel as usize).saturating_sub(in_flight as usize);
                for alloc in old_ver.iter().take(budget) {
                    result.placements.push(PlacementRequest {
                        group: group.clone(),
                        reason: PlacementReason::DestructiveUpdate { old: (**alloc).clone() },
                        sticky_node: sticky_node(group, alloc),
                    });
                    result.stops.push(StopRequest {
                        alloc: (**alloc).clone(),
                        evict: false,
                        description: "destructive update replacement".into(),
                    });
                }
            }
            // else: canaries placed, awaiting promotion — ignore.
        }
    }

    // Surplus / gap at the current version, only meaningful absent an
    // in-flight destructive update (that path owns the count already).
    if old_ver.is_empty() {
        let have = current_ver.len() as u32;
        if have > desired_count {
            for alloc in current_ver.iter().rev().take((have - desired_count) as usize) {
                result.stops.push(StopRequest {
                    alloc: (**alloc).clone(),
                    evict: false,
                    description: "surplus allocation".into(),
                });
            }
        } else if have < desired_count && failed.is_empty() {
            for _ in 0..(desired_count - have) {
                result.placements.push(PlacementRequest {
                    group: group.clone(),
                    reason: PlacementReason::New,
                    sticky_node: None,
                });
            }
        }
    }

    result
}

/// Job-level reconcile entry point deciding whether a deployment is needed
/// at all (spec.md §4.4 "Update policy").
#[must_use]
pub fn deployment_required(job: &Job, group: &TaskGroup, allocs: &[Allocation]) -> bool {
    group.update.max_parallel > 0
        && allocs
            .iter()
            .any(|a| a.task_group == group.name && a.job_version != job.version && a.is_running_or_pending())
}

#[must_use]
pub fn deployment_status_after(state: &TaskGroupDeploymentState) -> Option<DeploymentStatus> {
    state.is_healthy_complete().then_some(DeploymentStatus::Running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        AllocId, ClientStatus, DelayFunction, DeploymentAllocStatus, DesiredStatus, EphemeralDisk,
        JobId, JobType, MigratePolicy, NodeId, ReschedulePolicy, ResourceRequest, RescheduleTracker,
        TaskState, UpdatePolicy,
    };

    fn sample_job(version: u64) -> Job {
        Job {
            id: JobId::new("web"),
            namespace: "default".into(),
            region: "global".into(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".into()],
            groups: vec![],
            version,
            stable: false,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn sample_group(name: &str) -> TaskGroup {
        TaskGroup {
            name: name.into(),
            count: 3,
            constraints: vec![],
            affinities: vec![],
            spreads: vec![],
            resources: ResourceRequest {
                cpu_mhz: 500,
                memory_mb: 256,
                disk_mb: 1024,
                network_ports: 0,
            },
            restart: crate::domain::models::RestartPolicy {
                attempts: 2,
                interval_secs: 600,
            },
            reschedule: ReschedulePolicy::default(),
            migrate: MigratePolicy::default(),
            update: UpdatePolicy::default(),
            ephemeral_disk: EphemeralDisk::default(),
        }
    }

    fn sample_alloc(job_version: u64, status: ClientStatus) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: JobId::new("web"),
            job_version,
            task_group: "web".into(),
            node_id: NodeId::new("n1"),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: status,
            deployment_id: None,
            deployment_status: DeploymentAllocStatus::default(),
            previous_allocation: None,
            next_allocation: None,
            reschedule_tracker: RescheduleTracker::default(),
            metrics: Default::default(),
            resources: ResourceRequest {
                cpu_mhz: 500,
                memory_mb: 256,
                disk_mb: 1024,
                network_ports: 0,
            },
            assigned_ports: vec![],
            task_state: TaskState::Running,
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn fresh_job_places_full_count() {
        let job = sample_job(0);
        let group = sample_group("web");
        let result = reconcile_group(&job, &group, &[], 3, None, &[], Utc::now());
        assert_eq!(result.placements.len(), 3);
        assert!(result.stops.is_empty());
    }

    #[test]
    fn shrinking_count_stops_surplus() {
        let job = sample_job(0);
        let group = sample_group("web");
        let allocs = vec![
            sample_alloc(0, ClientStatus::Running),
            sample_alloc(0, ClientStatus::Running),
            sample_alloc(0, ClientStatus::Running),
        ];
        let result = reconcile_group(&job, &group, &allocs, 1, None, &[], Utc::now());
        assert_eq!(result.stops.len(), 2);
        assert!(result.placements.is_empty());
    }

    #[test]
    fn max_parallel_zero_leaves_old_running() {
        let job = sample_job(1);
        let mut group = sample_group("web");
        group.update.max_parallel = 0;
        let allocs = vec![sample_alloc(0, ClientStatus::Running)];
        let result = reconcile_group(&job, &group, &allocs, 3, None, &[], Utc::now());
        assert!(result.placements.is_empty());
        assert!(result.stops.is_empty());
        assert!(!result.is_destructive);
    }

    #[test]
    fn failed_alloc_due_for_reschedule_is_replaced() {
        let job = sample_job(0);
        let mut group = sample_group("web");
        group.reschedule = ReschedulePolicy {
            attempts: 3,
            interval_secs: 3600,
            delay_secs: 0,
            delay_function: DelayFunction::Constant,
            max_delay_secs: 3600,
            unlimited: false,
        };
        let allocs = vec![sample_alloc(0, ClientStatus::Failed)];
        let result = reconcile_group(&job, &group, &allocs, 1, None, &[], Utc::now());
        assert_eq!(result.placements.len(), 1);
        assert_eq!(result.stops.len(), 1);
    }

    #[test]
    fn canary_placed_without_stopping_old() {
        let job = sample_job(1);
        let mut group = sample_group("web");
        group.update.canary = 1;
        group.update.max_parallel = 1;
        let allocs = vec![
            sample_alloc(0, ClientStatus::Running),
            sample_alloc(0, ClientStatus::Running),
            sample_alloc(0, ClientStatus::Running),
        ];
        let result = reconcile_group(&job, &group, &allocs, 3, None, &[], Utc::now());
        assert_eq!(result.canaries_placed_this_round, 1);
        assert!(result.stops.is_empty(), "canaries never stop the old allocation");
    }
}
