//! DeploymentWatcher: one long-lived task per `running` deployment (spec.md
//! §4.6). Tracks allocation health transitions against each group's policy,
//! drives auto-promotion and the progress-deadline timer, and reacts to
//! operator promote/pause/fail calls persisted through the `StateStore`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::domain::error::DeploymentError;
use crate::domain::models::{
    ClientStatus, DeploymentAllocStatus, DeploymentHealth, DeploymentId, DeploymentStatus, EvalStatus,
    Evaluation, EvalId, JobId, TriggeredBy,
};
use crate::domain::ports::state_store::{StateStore, Table, WriteOp};
use crate::services::eval_broker::EvalBroker;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct DeploymentWatcher {
    deployment_id: DeploymentId,
    job_id: JobId,
    store: Arc<dyn StateStore>,
    broker: Arc<EvalBroker>,
}

impl DeploymentWatcher {
    #[must_use]
    pub fn new(deployment_id: DeploymentId, job_id: JobId, store: Arc<dyn StateStore>, broker: Arc<EvalBroker>) -> Self {
        Self {
            deployment_id,
            job_id,
            store,
            broker,
        }
    }

    /// Runs the watcher loop until the deployment reaches a terminal state
    /// or `shutdown` fires.
    #[instrument(skip(self, shutdown), fields(deployment_id = %self.deployment_id))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.watch(&[Table::Allocations, Table::Deployments]);
        info!("deployment watcher started");
        loop {
            tokio::select! {
                _ = changes.recv() => {}
                () = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            match self.tick().await {
                Ok(done) if done => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "deployment watcher tick failed");
                }
            }
        }
        info!("deployment watcher stopped");
    }

    /// One evaluation pass: re-derives health counters from current
    /// allocation state, applies the progress deadline, and checks for
    /// auto-promotion / completion. Returns `true` if the deployment reached
    /// a terminal status and the watcher should exit.
    async fn tick(&self) -> Result<bool, DeploymentError> {
        let view = self.store.snapshot().await;
        let Some(mut deployment) = view.get_deployment(&self.deployment_id).await else {
            return Ok(true);
        };
        if deployment.status.is_terminal() {
            return Ok(true);
        }
        if deployment.status == DeploymentStatus::Paused {
            return Ok(false);
        }

        let allocs = view.list_allocations_by_job(&self.job_id).await;
        let now = Utc::now();
        let mut should_fail = false;

        for (group_name, state) in &mut deployment.task_groups {
            let group_allocs: Vec<_> = allocs
                .iter()
                .filter(|a| &a.task_group == group_name && a.deployment_id == Some(self.deployment_id))
                .collect();

            let healthy = group_allocs
                .iter()
                .filter(|a| a.deployment_status.health == DeploymentHealth::Healthy)
                .count() as u32;
            let unhealthy = group_allocs
                .iter()
                .filter(|a| a.deployment_status.health == DeploymentHealth::Unhealthy || a.client_status == ClientStatus::Failed)
                .count() as u32;

            if healthy > state.healthy_allocs {
                state.deadline_at = Some(now + chrono::Duration::seconds(state.progress_deadline_secs as i64));
            }
            state.healthy_allocs = healthy;
            state.unhealthy_allocs = unhealthy;

            if let Some(deadline) = state.deadline_at {
                let target = if state.promoted { state.desired_total } else { state.desired_canaries };
                if now >= deadline && state.healthy_allocs < target {
                    should_fail = true;
                }
            }

            if !state.promoted && state.desired_canaries > 0 && state.healthy_allocs >= state.desired_canaries {
                // Canaries healthy; waits for manual or auto promotion below.
            } else if !state.promoted && state.desired_canaries == 0 && state.healthy_allocs >= state.desired_total {
                state.promoted = true;
            }
        }

        if should_fail {
            return self.fail_and_maybe_revert(deployment).await.map(|()| true);
        }

        if deployment.all_groups_promoted_and_healthy() {
            deployment.status = DeploymentStatus::Successful;
            self.store
                .apply(vec![WriteOp::PutDeployment(Box::new(deployment))])
                .await
                .map_err(DeploymentError::from)?;
            return Ok(true);
        }

        self.store
            .apply(vec![WriteOp::PutDeployment(Box::new(deployment))])
            .await
            .map_err(DeploymentError::from)?;
        Ok(false)
    }

    /// Operator call: promotes the named groups (or all groups when `groups`
    /// is empty), then enqueues a follow-up eval to replace the remaining
    /// old-version allocations.
    pub async fn promote(&self, groups: &[String]) -> Result<(), DeploymentError> {
        let view = self.store.snapshot().await;
        let mut deployment = view
            .get_deployment(&self.deployment_id)
            .await
            .ok_or(DeploymentError::NotFound(self.deployment_id))?;
        if deployment.status.is_terminal() {
            return Err(DeploymentError::AlreadyTerminal(self.deployment_id));
        }

        let targets: Vec<String> = if groups.is_empty() {
            deployment.task_groups.keys().cloned().collect()
        } else {
            groups.to_vec()
        };
        for group in &targets {
            let state = deployment
                .task_groups
                .get_mut(group)
                .ok_or_else(|| DeploymentError::UnknownGroup {
                    deployment_id: self.deployment_id,
                    group: group.clone(),
                })?;
            state.promoted = true;
        }

        self.store
            .apply(vec![WriteOp::PutDeployment(Box::new(deployment))])
            .await
            .map_err(DeploymentError::from)?;

        self.broker.enqueue(self.manual_eval(TriggeredBy::DeploymentWatcher)).await;
        Ok(())
    }

    /// Operator call: flips `status` to `paused`.
    pub async fn pause(&self) -> Result<(), DeploymentError> {
        self.set_status(DeploymentStatus::Paused).await
    }

    /// Operator call: resumes a paused deployment back to `running`.
    pub async fn resume(&self) -> Result<(), DeploymentError> {
        self.set_status(DeploymentStatus::Running).await
    }

    async fn set_status(&self, status: DeploymentStatus) -> Result<(), DeploymentError> {
        let view = self.store.snapshot().await;
        let mut deployment = view
            .get_deployment(&self.deployment_id)
            .await
            .ok_or(DeploymentError::NotFound(self.deployment_id))?;
        deployment.status = status;
        self.store
            .apply(vec![WriteOp::PutDeployment(Box::new(deployment))])
            .await
            .map_err(DeploymentError::from)?;
        Ok(())
    }

    async fn fail_and_maybe_revert(&self, mut deployment: crate::domain::models::Deployment) -> Result<(), DeploymentError> {
        deployment.status = DeploymentStatus::Failed;
        deployment.status_description = "progress deadline exceeded".into();
        let auto_revert = deployment.task_groups.values().any(|g| g.auto_revert);
        self.store
            .apply(vec![WriteOp::PutDeployment(Box::new(deployment))])
            .await
            .map_err(DeploymentError::from)?;

        if auto_revert {
            if let Some(job) = self.store.snapshot().await.get_job(&self.job_id).await {
                if job.stable {
                    self.broker.enqueue(self.manual_eval(TriggeredBy::DeploymentWatcher)).await;
                }
            }
        }
        Ok(())
    }

    fn manual_eval(&self, triggered_by: TriggeredBy) -> Evaluation {
        Evaluation {
            id: EvalId::new(),
            priority: 50,
            job_type: crate::domain::models::JobType::Service,
            namespace: "default".into(),
            triggered_by,
            job_id: self.job_id.clone(),
            job_modify_index: 0,
            node_id: None,
            status: EvalStatus::Pending,
            status_description: format!("deployment {} status change", self.deployment_id),
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
}

/// Marks a single allocation's deployment health, as driven by a task-state
/// success report plus `min_healthy_time` elapsing, or an explicit health
/// check result. Exposed as a free function since it mutates one allocation
/// independent of a running watcher (the health-check adapter calls this
/// directly, not through a `DeploymentWatcher` handle).
pub async fn mark_allocation_health(
    store: &dyn StateStore,
    alloc_id: crate::domain::models::AllocId,
    healthy: bool,
) -> Result<(), DeploymentError> {
    let view = store.snapshot().await;
    let Some(mut alloc) = view.get_allocation(&alloc_id).await else {
        return Ok(());
    };
    alloc.deployment_status = DeploymentAllocStatus {
        health: if healthy { DeploymentHealth::Healthy } else { DeploymentHealth::Unhealthy },
        healthy_since: healthy.then(Utc::now),
        canary: alloc.deployment_status.canary,
    };
    store
        .apply(vec![WriteOp::PutAllocation(Box::new(alloc))])
        .await
        .map_err(DeploymentError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStateStore;
    use crate::domain::models::{
        Allocation, AllocId, AllocMetrics, Deployment, DesiredStatus, Job, JobType, RescheduleTracker, ResourceRequest,
        TaskGroupDeploymentState, TaskState,
    };

    fn sample_job() -> Job {
        Job {
            id: JobId::new("web"),
            namespace: "default".into(),
            region: "global".into(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".into()],
            groups: vec![],
            version: 1,
            stable: true,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn sample_alloc(deployment_id: DeploymentId, health: DeploymentHealth) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: JobId::new("web"),
            job_version: 1,
            task_group: "web".into(),
            node_id: crate::domain::models::NodeId::new("n1"),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Running,
            deployment_id: Some(deployment_id),
            deployment_status: DeploymentAllocStatus {
                health,
                healthy_since: None,
                canary: false,
            },
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
    async fn all_healthy_promotes_and_completes_deployment() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(EvalBroker::new());
        let deployment_id = DeploymentId::new();

        store.apply(vec![WriteOp::PutJob(Box::new(sample_job()))]).await.unwrap();

        let mut deployment = Deployment::new(deployment_id, JobId::new("web"), 1, 1);
        deployment
            .task_groups
            .insert("web".into(), TaskGroupDeploymentState::new(1, 0, false, 600));
        store.apply(vec![WriteOp::PutDeployment(Box::new(deployment))]).await.unwrap();
        store
            .apply(vec![WriteOp::PutAllocation(Box::new(sample_alloc(deployment_id, DeploymentHealth::Healthy)))])
            .await
            .unwrap();

        let watcher = DeploymentWatcher::new(deployment_id, JobId::new("web"), store.clone(), broker);
        let done = watcher.tick().await.unwrap();
        assert!(done);

        let final_state = store.snapshot().await.get_deployment(&deployment_id).await.unwrap();
        assert_eq!(final_state.status, DeploymentStatus::Successful);
    }

    #[tokio::test]
    async fn promote_flips_groups_and_enqueues_eval() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(EvalBroker::new());
        let deployment_id = DeploymentId::new();

        store.apply(vec![WriteOp::PutJob(Box::new(sample_job()))]).await.unwrap();
        let mut deployment = Deployment::new(deployment_id, JobId::new("web"), 1, 1);
        deployment
            .task_groups
            .insert("web".into(), TaskGroupDeploymentState::new(3, 1, false, 600));
        store.apply(vec![WriteOp::PutDeployment(Box::new(deployment))]).await.unwrap();

        let watcher = DeploymentWatcher::new(deployment_id, JobId::new("web"), store.clone(), broker.clone());
        watcher.promote(&[]).await.unwrap();

        let updated = store.snapshot().await.get_deployment(&deployment_id).await.unwrap();
        assert!(updated.task_groups["web"].promoted);
        assert_eq!(broker.len_ready().await, 1);
    }
}
