//! Phase D — plan construction (spec.md §4.4).

use chrono::Utc;

use crate::domain::models::{
    Allocation, AllocId, AllocMetrics, AllocUpdate, ClientStatus, DeploymentAllocStatus, DeploymentId,
    DesiredStatus, Job, Node, Plan, RescheduleEvent, RescheduleTracker, TaskState,
};

use super::reconcile::{PlacementReason, PlacementRequest};

/// Resolves `count` dynamic ports from the node's pool that aren't already
/// claimed by `taken` (allocations placed earlier in the same plan).
fn assign_ports(node: &Node, count: u16, taken: &[u16]) -> Vec<u16> {
    (node.resources.dynamic_port_min..=node.resources.dynamic_port_max)
        .filter(|p| !taken.contains(p))
        .take(count as usize)
        .collect()
}

/// Builds one new [`Allocation`] for a placement request on `node`, wiring up
/// the replacement chain (`previous_allocation`/`next_allocation`) and
/// reschedule tracker when the request supersedes an existing allocation.
#[must_use]
pub fn build_allocation(
    job: &Job,
    node: &Node,
    request: &PlacementRequest,
    deployment_id: Option<DeploymentId>,
    taken_ports: &[u16],
) -> Allocation {
    let ports = assign_ports(node, request.group.resources.network_ports, taken_ports);
    let now = Utc::now();

    let (previous_allocation, reschedule_tracker, canary) = match &request.reason {
        PlacementReason::Reschedule { old } => {
            let mut tracker = old.reschedule_tracker.clone();
            tracker.events.push(RescheduleEvent {
                time: now,
                delay_secs: 0,
                prev_alloc_id: old.id,
                prev_node_id: Some(old.node_id.clone()),
            });
            (Some(old.id), tracker, false)
        }
        PlacementReason::Migrate { old } | PlacementReason::DestructiveUpdate { old } => {
            (Some(old.id), old.reschedule_tracker.clone(), false)
        }
        PlacementReason::Canary { old } => (Some(old.id), old.reschedule_tracker.clone(), true),
        PlacementReason::New => (None, RescheduleTracker::default(), false),
    };

    Allocation {
        id: AllocId::new(),
        job_id: job.id.clone(),
        job_version: job.version,
        task_group: request.group.name.clone(),
        node_id: node.id.clone(),
        desired_status: DesiredStatus::Run,
        desired_description: String::new(),
        client_status: ClientStatus::Pending,
        deployment_id,
        deployment_status: DeploymentAllocStatus {
            canary,
            ..DeploymentAllocStatus::default()
        },
        previous_allocation,
        next_allocation: None,
        reschedule_tracker,
        metrics: AllocMetrics::default(),
        resources: request.group.resources,
        assigned_ports: ports,
        task_state: TaskState::Pending,
        create_index: 0,
        modify_index: 0,
    }
}

/// Appends an `AllocUpdate` stop entry for a superseded allocation to the
/// plan, marking eviction when the request came from preemption.
pub fn add_stop(plan: &mut Plan, node_id: crate::domain::models::NodeId, alloc: &Allocation, description: &str, evict: bool) {
    plan.stop(
        node_id,
        AllocUpdate {
            alloc_id: alloc.id,
            desired_description: description.to_string(),
            evict,
        },
    );
}
