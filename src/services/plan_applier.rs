//! Plan application: the serialized choke point between a scheduling
//! decision and the `StateStore` (spec.md §4.5). Plans are applied one at a
//! time per node so the optimistic resource check the scheduler already ran
//! gets one more, authoritative pass against whatever landed on the node
//! since the snapshot was taken.

use std::sync::Arc;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use tracing::{instrument, warn};

use crate::domain::error::StateStoreError;
use crate::domain::models::{AllocId, Deployment, NodeId, Plan, PlanResult};
use crate::domain::ports::state_store::{StateStore, WriteOp};

/// Applies [`Plan`]s against a [`StateStore`], retrying transaction
/// conflicts with backoff and honoring `all_at_once` all-or-nothing
/// semantics for placements (stops and preemptions always commit).
pub struct PlanApplier {
    store: Arc<dyn StateStore>,
}

impl PlanApplier {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Applies `plan`, re-checking node capacity against the latest snapshot
    /// before committing placements. Drops individual placements that no
    /// longer fit; if `plan.all_at_once` and any placement was dropped, the
    /// whole placement set is dropped (stops/preemptions still commit).
    /// `deployment` is written alongside the plan when the scheduling pass
    /// created or mutated one.
    #[instrument(skip(self, plan, deployment), fields(eval_id = %plan.eval_id))]
    pub async fn apply(&self, plan: Plan, deployment: Option<Deployment>) -> Result<PlanResult, StateStoreError> {
        let backoff_policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(20))
            .with_max_interval(std::time::Duration::from_millis(500))
            .with_max_elapsed_time(Some(std::time::Duration::from_secs(5)))
            .build();

        retry(backoff_policy, || async {
            self.try_apply(&plan, deployment.clone())
                .await
                .map_err(|e| match e {
                    StateStoreError::TxnConflict { .. } => backoff::Error::transient(e),
                    other => backoff::Error::permanent(other),
                })
        })
        .await
    }

    async fn try_apply(&self, plan: &Plan, deployment: Option<Deployment>) -> Result<PlanResult, StateStoreError> {
        let view = self.store.snapshot().await;
        let mut batch = Vec::new();
        let mut accepted = Vec::new();
        let mut dropped = Vec::new();

        for (node_id, allocs) in &plan.node_allocations {
            let Some(node) = view.get_node(node_id).await else {
                dropped.extend(allocs.iter().map(|a| a.id));
                continue;
            };
            if !node.is_schedulable() {
                dropped.extend(allocs.iter().map(|a| a.id));
                continue;
            }
            let mut used = committed_usage(&*view, node_id).await;
            for alloc in allocs {
                if node.resources.fits(&node.reserved, &used, &alloc.resources) {
                    used.cpu_mhz += alloc.resources.cpu_mhz;
                    used.memory_mb += alloc.resources.memory_mb;
                    used.disk_mb += alloc.resources.disk_mb;
                    accepted.push(alloc.id);
                } else {
                    dropped.push(alloc.id);
                }
            }
        }

        let all_at_once_rejected = plan.all_at_once && !dropped.is_empty();
        if all_at_once_rejected {
            warn!(eval_id = %plan.eval_id, dropped = dropped.len(), "all_at_once plan rejected");
            accepted.clear();
        } else {
            let accepted_set: std::collections::HashSet<AllocId> = accepted.iter().copied().collect();
            for allocs in plan.node_allocations.values() {
                for alloc in allocs {
                    if accepted_set.contains(&alloc.id) {
                        batch.push(WriteOp::PutAllocation(Box::new(alloc.clone())));
                    }
                }
            }
        }

        for updates in plan.node_updates.values() {
            for update in updates {
                if let Some(mut alloc) = view.get_allocation(&update.alloc_id).await {
                    alloc.desired_status = if update.evict {
                        crate::domain::models::DesiredStatus::Evict
                    } else {
                        crate::domain::models::DesiredStatus::Stop
                    };
                    alloc.desired_description = update.desired_description.clone();
                    batch.push(WriteOp::PutAllocation(Box::new(alloc)));
                }
            }
        }

        for updates in plan.node_preemptions.values() {
            for update in updates {
                if let Some(mut alloc) = view.get_allocation(&update.alloc_id).await {
                    alloc.desired_status = crate::domain::models::DesiredStatus::Evict;
                    alloc.desired_description = update.desired_description.clone();
                    batch.push(WriteOp::PutAllocation(Box::new(alloc)));
                }
            }
        }

        if let Some(mut dep) = deployment {
            if !all_at_once_rejected {
                for update in &plan.deployment_updates {
                    if update.deployment_id != dep.id {
                        continue;
                    }
                    for (group, delta) in &update.placed_delta {
                        if let Some(suffix) = group.strip_suffix(".canaries") {
                            if let Some(state) = dep.task_groups.get_mut(suffix) {
                                state.placed_canaries += delta;
                            }
                        } else if let Some(state) = dep.task_groups.get_mut(group) {
                            state.placed_allocs += delta;
                        }
                    }
                }
            }
            batch.push(WriteOp::PutDeployment(Box::new(dep)));
        }

        let index = if batch.is_empty() { view.index() } else { self.store.apply(batch).await? };

        Ok(PlanResult {
            index,
            accepted: if all_at_once_rejected { vec![] } else { accepted },
            dropped,
            all_at_once_rejected,
        })
    }
}

async fn committed_usage(
    view: &dyn crate::domain::ports::state_store::ReadView,
    node_id: &NodeId,
) -> crate::domain::models::ResourceRequest {
    let mut used = crate::domain::models::ResourceRequest {
        cpu_mhz: 0,
        memory_mb: 0,
        disk_mb: 0,
        network_ports: 0,
    };
    for alloc in view.list_allocations_by_node(node_id).await {
        if alloc.is_running_or_pending() {
            used.cpu_mhz += alloc.resources.cpu_mhz;
            used.memory_mb += alloc.resources.memory_mb;
            used.disk_mb += alloc.resources.disk_mb;
        }
    }
    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStateStore;
    use crate::domain::models::{
        Allocation, AllocId, AllocMetrics, ClientStatus, DeploymentAllocStatus, DesiredStatus, EvalId, Job, JobId,
        JobType, Node, NodeResources, NodeStatus, RescheduleTracker, ResourceRequest, SchedulingEligibility,
        TaskGroup, TaskState,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_node() -> Node {
        Node {
            id: NodeId::new("n1"),
            datacenter: "dc1".into(),
            class: "default".into(),
            attributes: HashMap::new(),
            resources: NodeResources {
                cpu_mhz: 4000,
                memory_mb: 8192,
                disk_mb: 100_000,
                dynamic_port_min: 20000,
                dynamic_port_max: 32000,
            },
            reserved: NodeResources {
                cpu_mhz: 0,
                memory_mb: 0,
                disk_mb: 0,
                dynamic_port_min: 0,
                dynamic_port_max: 0,
            },
            drivers: HashMap::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain_strategy: None,
            last_heartbeat: Utc::now(),
            create_index: 1,
            modify_index: 1,
        }
    }

    fn sample_alloc(node_id: NodeId, cpu_mhz: u64) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: JobId::new("job"),
            job_version: 0,
            task_group: "web".into(),
            node_id,
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            deployment_id: None,
            deployment_status: DeploymentAllocStatus::default(),
            previous_allocation: None,
            next_allocation: None,
            reschedule_tracker: RescheduleTracker::default(),
            metrics: AllocMetrics::default(),
            resources: ResourceRequest {
                cpu_mhz,
                memory_mb: 512,
                disk_mb: 1024,
                network_ports: 0,
            },
            assigned_ports: vec![],
            task_state: TaskState::Pending,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test]
    async fn oversized_placement_is_dropped() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.apply(vec![WriteOp::PutNode(Box::new(sample_node()))]).await.unwrap();
        let applier = PlanApplier::new(store);

        let mut plan = Plan::new(EvalId::new(), 50, false);
        plan.place(NodeId::new("n1"), sample_alloc(NodeId::new("n1"), 10_000));

        let result = applier.apply(plan, None).await.unwrap();
        assert!(result.accepted.is_empty());
        assert_eq!(result.dropped.len(), 1);
    }

    #[tokio::test]
    async fn all_at_once_drops_entire_placement_set_on_any_rejection() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.apply(vec![WriteOp::PutNode(Box::new(sample_node()))]).await.unwrap();
        let applier = PlanApplier::new(store);

        let mut plan = Plan::new(EvalId::new(), 50, true);
        plan.place(NodeId::new("n1"), sample_alloc(NodeId::new("n1"), 1000));
        plan.place(NodeId::new("n1"), sample_alloc(NodeId::new("n1"), 10_000));

        let result = applier.apply(plan, None).await.unwrap();
        assert!(result.all_at_once_rejected);
        assert!(result.accepted.is_empty());
    }

    #[tokio::test]
    async fn placement_onto_ineligible_node_is_dropped() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut node = sample_node();
        node.scheduling_eligibility = SchedulingEligibility::Ineligible;
        store.apply(vec![WriteOp::PutNode(Box::new(node))]).await.unwrap();
        let applier = PlanApplier::new(store);

        let mut plan = Plan::new(EvalId::new(), 50, false);
        plan.place(NodeId::new("n1"), sample_alloc(NodeId::new("n1"), 1000));

        let result = applier.apply(plan, None).await.unwrap();
        assert!(result.accepted.is_empty());
        assert_eq!(result.dropped.len(), 1);
    }

    #[tokio::test]
    async fn fitting_placement_commits() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.apply(vec![WriteOp::PutNode(Box::new(sample_node()))]).await.unwrap();
        let applier = PlanApplier::new(store);

        let mut plan = Plan::new(EvalId::new(), 50, false);
        let alloc = sample_alloc(NodeId::new("n1"), 1000);
        let alloc_id = alloc.id;
        plan.place(NodeId::new("n1"), alloc);

        let result = applier.apply(plan, None).await.unwrap();
        assert_eq!(result.accepted, vec![alloc_id]);
        assert!(result.dropped.is_empty());
    }
}
