//! The scheduler: a pure function from a read snapshot + an eval to a
//! [`Plan`] (spec.md §4.4). `schedule` dispatches the same reconcile/
//! feasibility/scoring/plan-builder pipeline for service, batch, and system
//! jobs — the only difference between job types is how many instances of
//! each group are desired and whether a destructive update creates a
//! deployment at all (batch/system jobs never deploy).

pub mod feasibility;
pub mod plan_builder;
pub mod reconcile;
pub mod scoring;

use std::collections::HashMap;

use chrono::Utc;
use tracing::{instrument, warn};

use crate::domain::error::SchedulerError;
use crate::domain::models::{
    AllocId, Deployment, DeploymentId, Evaluation, FailedTGAlloc, JobType, Node, NodeId, Plan,
    TaskGroupDeploymentState,
};
use crate::domain::ports::state_store::ReadView;

use feasibility::{OptimisticUsage, PlacementCohort};
use reconcile::{reconcile_group, PlacementReason};

/// Everything produced by one scheduling pass: the plan to submit to the
/// applier, any per-group placement failures (for a `blocked` eval), and a
/// deployment row to create or update alongside the plan.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub plan: Plan,
    pub failed_tg_allocs: Vec<FailedTGAlloc>,
    pub deployment: Option<Deployment>,
    /// Failed allocations not yet due for reschedule, with the time a
    /// follow-up eval should fire (spec.md §4.8).
    pub delayed_reschedules: Vec<(AllocId, chrono::DateTime<Utc>)>,
}

impl ScheduleOutcome {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.failed_tg_allocs.is_empty()
    }
}

/// Computes a [`Plan`] for the job referenced by `eval` against `snapshot`.
#[instrument(skip(snapshot, eval), fields(job_id = %eval.job_id, eval_id = %eval.id))]
pub async fn schedule(snapshot: &dyn ReadView, eval: &Evaluation) -> Result<ScheduleOutcome, SchedulerError> {
    let mut plan = Plan::new(eval.id, eval.priority, false);

    let Some(job) = snapshot.get_job(&eval.job_id).await else {
        // Job was deregistered: tear down everything that's still running.
        for alloc in snapshot.list_allocations_by_job(&eval.job_id).await {
            if alloc.is_running_or_pending() {
                plan_builder::add_stop(&mut plan, alloc.node_id.clone(), &alloc, "job deregistered", false);
            }
        }
        return Ok(ScheduleOutcome {
            plan,
            failed_tg_allocs: vec![],
            deployment: None,
            delayed_reschedules: vec![],
        });
    };

    let nodes: Vec<_> = snapshot
        .list_nodes()
        .await
        .into_iter()
        .filter(|n| job.datacenters.is_empty() || job.datacenters.contains(&n.datacenter))
        .collect();
    let allocs = snapshot.list_allocations_by_job(&job.id).await;

    let existing_deployment = snapshot
        .list_deployments_by_job(&job.id)
        .await
        .into_iter()
        .find(|d| d.job_version == job.version && !d.status.is_terminal());

    let now = Utc::now();
    let eligible_node_count = nodes.iter().filter(|n| n.is_schedulable() && !n.is_draining()).count() as u32;

    let mut usage = OptimisticUsage::default();
    let mut failed_tg_allocs = Vec::new();
    let mut new_deployment: Option<Deployment> = existing_deployment.clone();
    let mut deployment_deltas: HashMap<String, u32> = HashMap::new();
    let mut delayed_reschedules = Vec::new();

    for group in &job.groups {
        let desired_count = if job.job_type == JobType::System {
            eligible_node_count
        } else {
            group.count
        };

        let group_deployment_state = existing_deployment
            .as_ref()
            .and_then(|d| d.task_groups.get(&group.name));

        let draining_allocs: Vec<AllocId> = allocs
            .iter()
            .filter(|a| {
                a.task_group == group.name
                    && nodes.iter().find(|n| n.id == a.node_id).is_some_and(Node::is_draining)
            })
            .map(|a| a.id)
            .collect();

        let recon = reconcile_group(&job, group, &allocs, desired_count, group_deployment_state, &draining_allocs, now);

        if recon.is_destructive && new_deployment.is_none() {
            let mut deployment = Deployment::new(DeploymentId::new(), job.id.clone(), job.version, snapshot.index());
            deployment.task_groups.insert(
                group.name.clone(),
                TaskGroupDeploymentState::new(
                    desired_count,
                    group.update.canary,
                    group.update.auto_revert,
                    group.update.progress_deadline_secs,
                ),
            );
            new_deployment = Some(deployment);
        } else if recon.is_destructive {
            if let Some(dep) = new_deployment.as_mut() {
                dep.task_groups.entry(group.name.clone()).or_insert_with(|| {
                    TaskGroupDeploymentState::new(
                        desired_count,
                        group.update.canary,
                        group.update.auto_revert,
                        group.update.progress_deadline_secs,
                    )
                });
            }
        }

        let deployment_id = new_deployment.as_ref().map(|d| d.id);

        // Nodes already hosting a live allocation of this group, for
        // distinct_hosts, plus a per-attribute-value count for
        // distinct_property (open question #3: canaries count).
        let mut occupied: Vec<NodeId> = allocs
            .iter()
            .filter(|a| a.task_group == group.name && a.is_running_or_pending())
            .map(|a| a.node_id.clone())
            .collect();
        let mut property_counts: HashMap<String, u32> = HashMap::new();
        for node_id in &occupied {
            if let Some(node) = nodes.iter().find(|n| &n.id == node_id) {
                for c in &group.constraints {
                    if c.operator == crate::domain::models::ConstraintOperator::DistinctProperty {
                        if let Some(v) = node.attributes.get(c.l_target.trim_start_matches("${attr.").trim_end_matches('}')) {
                            *property_counts.entry(v.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        let fleet_size = nodes.len();

        for request in &recon.placements {
            let cohort = PlacementCohort {
                occupied_nodes: &occupied,
                property_counts: &property_counts,
            };
            let mut feasible = feasibility::feasible_nodes(&nodes, &job.datacenters, group, &usage, &cohort);
            if job.job_type == JobType::System {
                feasible.retain(|n| !occupied.contains(&n.id));
            }

            if feasible.is_empty() {
                failed_tg_allocs.push(FailedTGAlloc {
                    task_group: group.name.clone(),
                    metrics: crate::domain::models::AllocMetrics {
                        nodes_evaluated: nodes.len() as u32,
                        nodes_filtered: nodes.len() as u32,
                        nodes_exhausted: vec!["resources".into(), "constraints".into()],
                        class_exhausted: HashMap::new(),
                        score: None,
                    },
                });
                continue;
            }

            let ctx = scoring::ScoringContext {
                usage: &usage,
                reschedule_penalty_nodes: &collect_reschedule_penalty_nodes(&recon.placements),
                same_job_group_counts: &property_counts_by_node(&allocs, &group.name),
                spread_distribution: &property_counts,
                spread_total: occupied.len() as u32,
            };

            let Some(best) = scoring::pick_best(&feasible, group, &ctx, desired_count, fleet_size) else {
                continue;
            };

            let taken: Vec<u16> = plan
                .node_allocations
                .get(&best.id)
                .map(|v| v.iter().flat_map(|a| a.assigned_ports.clone()).collect())
                .unwrap_or_default();
            let alloc = plan_builder::build_allocation(&job, best, request, deployment_id, &taken);
            usage.reserve(best.id.clone(), group.resources);
            occupied.push(best.id.clone());
            plan.place(best.id.clone(), alloc);

            if matches!(request.reason, PlacementReason::Canary { .. }) {
                *deployment_deltas.entry(format!("{}.canaries", group.name)).or_insert(0) += 1;
            } else {
                *deployment_deltas.entry(group.name.clone()).or_insert(0) += 1;
            }
        }

        for stop in &recon.stops {
            plan_builder::add_stop(&mut plan, stop.alloc.node_id.clone(), &stop.alloc, &stop.description, false);
        }
        delayed_reschedules.extend(recon.delayed.iter().copied());

        // `placed_allocs`/`placed_canaries` are bumped exactly once, by the
        // applier, from `deployment_deltas` below — not here — since the
        // `Deployment` built in this pass is the same object the applier
        // writes back; double-applying the delta inflates
        // `in_flight = placed_allocs - healthy_allocs` and stalls the
        // rollout's `max_parallel` budget.
    }

    if !deployment_deltas.is_empty() {
        if let Some(dep) = &new_deployment {
            plan.deployment_updates.push(crate::domain::models::DeploymentUpdate {
                deployment_id: dep.id,
                placed_delta: deployment_deltas,
            });
        }
    }

    if !failed_tg_allocs.is_empty() {
        warn!(job_id = %job.id, failures = failed_tg_allocs.len(), "placement incomplete, eval will be blocked");
    }

    Ok(ScheduleOutcome {
        plan,
        failed_tg_allocs,
        deployment: new_deployment,
        delayed_reschedules,
    })
}

fn collect_reschedule_penalty_nodes(placements: &[reconcile::PlacementRequest]) -> Vec<NodeId> {
    placements
        .iter()
        .filter_map(|p| match &p.reason {
            PlacementReason::Reschedule { old } => Some(old.node_id.clone()),
            _ => None,
        })
        .collect()
}

fn property_counts_by_node(
    allocs: &[crate::domain::models::Allocation],
    group_name: &str,
) -> HashMap<NodeId, u32> {
    let mut counts = HashMap::new();
    for alloc in allocs.iter().filter(|a| a.task_group == group_name && a.is_running_or_pending()) {
        *counts.entry(alloc.node_id.clone()).or_insert(0) += 1;
    }
    counts
}
