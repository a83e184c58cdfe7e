//! DrainCoordinator: one long-lived task per node carrying a `drainStrategy`
//! (spec.md §4.7). Classifies the node's allocations by their group's
//! migrate policy, emits `node-drain` evals for the scheduler to turn into
//! migrations, force-stops on deadline, and restores eligibility once the
//! node is clear.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::domain::error::DrainError;
use crate::domain::models::{
    AllocId, ClientStatus, DesiredStatus, EvalId, EvalStatus, Evaluation, JobId, JobType, NodeId, TriggeredBy,
};
use crate::domain::ports::state_store::{StateStore, WriteOp};
use crate::services::eval_broker::EvalBroker;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct DrainCoordinator {
    node_id: NodeId,
    store: Arc<dyn StateStore>,
    broker: Arc<EvalBroker>,
}

impl DrainCoordinator {
    #[must_use]
    pub fn new(node_id: NodeId, store: Arc<dyn StateStore>, broker: Arc<EvalBroker>) -> Self {
        Self { node_id, store, broker }
    }

    #[instrument(skip(self, shutdown), fields(node_id = %self.node_id))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("drain coordinator started");
        loop {
            match self.tick().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "drain coordinator tick failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("drain coordinator stopped");
    }

    /// One pass: force-stops everything if the deadline has passed,
    /// otherwise migrates service allocations up to `migrate.max_parallel`
    /// per (job, group) and leaves batch/system allocations per policy.
    /// Returns `true` once the node is fully drained.
    async fn tick(&self) -> Result<bool, DrainError> {
        let view = self.store.snapshot().await;
        let Some(node) = view.get_node(&self.node_id).await else {
            return Ok(true);
        };
        let Some(strategy) = node.drain_strategy.clone() else {
            return Ok(true);
        };

        let allocs: Vec<_> = view
            .list_allocations_by_node(&self.node_id)
            .await
            .into_iter()
            .filter(|a| a.is_running_or_pending())
            .collect();

        if allocs.is_empty() {
            return self.complete_drain().await.map(|()| true);
        }

        let now = Utc::now();
        if strategy.force_deadline || now >= strategy.deadline {
            self.force_stop_all(&allocs).await?;
            return Ok(false);
        }

        let mut jobs_by_id = HashMap::new();
        for alloc in &allocs {
            if !jobs_by_id.contains_key(&alloc.job_id) {
                if let Some(job) = view.get_job(&alloc.job_id).await {
                    jobs_by_id.insert(alloc.job_id.clone(), job);
                }
            }
        }

        let non_system_remaining = allocs
            .iter()
            .any(|a| jobs_by_id.get(&a.job_id).is_some_and(|j| j.job_type != JobType::System));

        let mut migrate_counts: HashMap<(JobId, String), u32> = HashMap::new();
        let mut touched_jobs = std::collections::HashSet::new();

        for alloc in &allocs {
            let Some(job) = jobs_by_id.get(&alloc.job_id) else { continue };
            match job.job_type {
                JobType::Batch | JobType::PeriodicParent | JobType::ParameterizedParent => continue,
                JobType::System if strategy.ignore_system_jobs || non_system_remaining => continue,
                _ => {}
            }

            let Some(group) = job.group(&alloc.task_group) else { continue };
            let key = (job.id.clone(), group.name.clone());
            let in_flight = *migrate_counts.get(&key).unwrap_or(&0);
            if in_flight >= group.migrate.max_parallel.max(1) {
                continue;
            }
            migrate_counts.insert(key, in_flight + 1);
            touched_jobs.insert(job.id.clone());
        }

        for job_id in touched_jobs {
            self.broker.enqueue(self.drain_eval(job_id)).await;
        }

        Ok(false)
    }

    async fn force_stop_all(&self, allocs: &[crate::domain::models::Allocation]) -> Result<(), DrainError> {
        let mut batch = Vec::new();
        for alloc in allocs {
            let mut updated = alloc.clone();
            updated.desired_status = DesiredStatus::Stop;
            updated.desired_description = "force-stopped: drain deadline exceeded".into();
            batch.push(WriteOp::PutAllocation(Box::new(updated)));
        }
        self.store.apply(batch).await.map_err(DrainError::from)?;
        Ok(())
    }

    async fn complete_drain(&self) -> Result<(), DrainError> {
        let view = self.store.snapshot().await;
        let Some(mut node) = view.get_node(&self.node_id).await else {
            return Ok(());
        };
        let restore_eligibility = node.drain_strategy.as_ref().is_some_and(|s| s.mark_eligible_on_complete);
        node.drain_strategy = None;
        if restore_eligibility {
            node.scheduling_eligibility = crate::domain::models::SchedulingEligibility::Eligible;
        }
        self.store
            .apply(vec![WriteOp::PutNode(Box::new(node))])
            .await
            .map_err(DrainError::from)?;
        Ok(())
    }

    fn drain_eval(&self, job_id: JobId) -> Evaluation {
        Evaluation {
            id: EvalId::new(),
            priority: 50,
            job_type: JobType::Service,
            namespace: "default".into(),
            triggered_by: TriggeredBy::NodeDrain,
            job_id,
            job_modify_index: 0,
            node_id: Some(self.node_id.clone()),
            status: EvalStatus::Pending,
            status_description: format!("node {} draining", self.node_id),
            wait_until: None,
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            failed_tg_allocs: vec![],
            class_eligibility: crate::domain::models::ClassEligibility::default(),
            snapshot_index: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Marks a single allocation as force-stopped. Used by the deadline
    /// sweep to act on one allocation without re-deriving the full set
    /// (the CLI's `node drain -force` path calls this directly).
    pub async fn force_stop_one(&self, alloc_id: AllocId) -> Result<(), DrainError> {
        let view = self.store.snapshot().await;
        let Some(mut alloc) = view.get_allocation(&alloc_id).await else {
            return Ok(());
        };
        alloc.desired_status = DesiredStatus::Stop;
        alloc.desired_description = "force-stopped by operator".into();
        self.store
            .apply(vec![WriteOp::PutAllocation(Box::new(alloc))])
            .await
            .map_err(DrainError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStateStore;
    use crate::domain::models::{
        Allocation, AllocMetrics, DeploymentAllocStatus, DrainStrategy, Job, MigratePolicy, NodeResources, NodeStatus,
        RescheduleTracker, ResourceRequest, SchedulingEligibility, TaskGroup, TaskState, UpdatePolicy,
    };

    fn sample_node(draining: bool) -> crate::domain::models::Node {
        crate::domain::models::Node {
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
            scheduling_eligibility: SchedulingEligibility::Ineligible,
            drain_strategy: draining.then(|| DrainStrategy {
                deadline: Utc::now() + chrono::Duration::hours(1),
                ignore_system_jobs: false,
                force_deadline: true,
                mark_eligible_on_complete: true,
            }),
            last_heartbeat: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    fn sample_job() -> Job {
        Job {
            id: JobId::new("web"),
            namespace: "default".into(),
            region: "global".into(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".into()],
            groups: vec![TaskGroup {
                name: "web".into(),
                count: 2,
                constraints: vec![],
                affinities: vec![],
                spreads: vec![],
                resources: ResourceRequest {
                    cpu_mhz: 100,
                    memory_mb: 128,
                    disk_mb: 256,
                    network_ports: 0,
                },
                restart: crate::domain::models::RestartPolicy {
                    attempts: 2,
                    interval_secs: 600,
                },
                reschedule: crate::domain::models::ReschedulePolicy::default(),
                migrate: MigratePolicy {
                    max_parallel: 1,
                    health_check_secs: 10,
                },
                update: UpdatePolicy::default(),
                ephemeral_disk: crate::domain::models::EphemeralDisk::default(),
            }],
            version: 0,
            stable: true,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn sample_alloc() -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: JobId::new("web"),
            job_version: 0,
            task_group: "web".into(),
            node_id: NodeId::new("n1"),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Running,
            deployment_id: None,
            deployment_status: DeploymentAllocStatus::default(),
            previous_allocation: None,
            next_allocation: None,
            reschedule_tracker: RescheduleTracker::default(),
            metrics: AllocMetrics::default(),
            resources: ResourceRequest {
                cpu_mhz: 100,
                memory_mb: 128,
                disk_mb: 256,
                network_ports: 0,
            },
            assigned_ports: vec![],
            task_state: TaskState::Running,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test]
    async fn no_allocations_completes_drain_and_restores_eligibility() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.apply(vec![WriteOp::PutNode(Box::new(sample_node(true)))]).await.unwrap();
        let broker = Arc::new(EvalBroker::new());
        let coordinator = DrainCoordinator::new(NodeId::new("n1"), store.clone(), broker);

        let done = coordinator.tick().await.unwrap();
        assert!(done);

        let node = store.snapshot().await.get_node(&NodeId::new("n1")).await.unwrap();
        assert!(node.drain_strategy.is_none());
        assert_eq!(node.scheduling_eligibility, SchedulingEligibility::Eligible);
    }

    #[tokio::test]
    async fn live_allocation_emits_drain_eval() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store
            .apply(vec![
                WriteOp::PutNode(Box::new(sample_node(true))),
                WriteOp::PutJob(Box::new(sample_job())),
                WriteOp::PutAllocation(Box::new(sample_alloc())),
            ])
            .await
            .unwrap();
        let broker = Arc::new(EvalBroker::new());
        let coordinator = DrainCoordinator::new(NodeId::new("n1"), store, broker.clone());

        let done = coordinator.tick().await.unwrap();
        assert!(!done);
        assert_eq!(broker.len_ready().await, 1);
    }

    #[tokio::test]
    async fn deadline_exceeded_force_stops_everything() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut node = sample_node(true);
        node.drain_strategy.as_mut().unwrap().deadline = Utc::now() - chrono::Duration::seconds(1);
        store
            .apply(vec![
                WriteOp::PutNode(Box::new(node)),
                WriteOp::PutJob(Box::new(sample_job())),
                WriteOp::PutAllocation(Box::new(sample_alloc())),
            ])
            .await
            .unwrap();
        let broker = Arc::new(EvalBroker::new());
        let coordinator = DrainCoordinator::new(NodeId::new("n1"), store.clone(), broker);

        coordinator.tick().await.unwrap();

        let allocs = store.snapshot().await.list_allocations_by_node(&NodeId::new("n1")).await;
        assert!(allocs.iter().all(|a| a.desired_status == DesiredStatus::Stop));
    }

    #[tokio::test]
    async fn deadline_exceeded_force_stops_with_default_force_deadline_flag() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut node = sample_node(true);
        let strategy = node.drain_strategy.as_mut().unwrap();
        strategy.deadline = Utc::now() - chrono::Duration::seconds(1);
        strategy.force_deadline = false;
        store
            .apply(vec![
                WriteOp::PutNode(Box::new(node)),
                WriteOp::PutJob(Box::new(sample_job())),
                WriteOp::PutAllocation(Box::new(sample_alloc())),
            ])
            .await
            .unwrap();
        let broker = Arc::new(EvalBroker::new());
        let coordinator = DrainCoordinator::new(NodeId::new("n1"), store.clone(), broker);

        coordinator.tick().await.unwrap();

        let allocs = store.snapshot().await.list_allocations_by_node(&NodeId::new("n1")).await;
        assert!(allocs.iter().all(|a| a.desired_status == DesiredStatus::Stop));
    }
}
