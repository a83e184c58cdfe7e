//! `Orchestrator`: the facade that wires the `StateStore` port to the
//! `EvalBroker`, the scheduling worker pool, `PlanApplier`, and the
//! per-deployment/per-drain long-lived tasks (spec.md §6). Owns the single
//! `watch::Sender<bool>` shutdown signal every long-lived task selects on,
//! matching the teacher's lifecycle-management convention of one context
//! cancelling everything on step-down.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::domain::error::{DeploymentError, OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    ClassEligibility, DeploymentId, DrainStrategy, EvalId, EvalStatus, Evaluation, Job, JobId,
    Node, NodeId, SchedulingEligibility, TriggeredBy,
};
use crate::domain::ports::state_store::{StateStore, WriteOp};
use crate::infrastructure::config::OrchestratorConfig;
use crate::services::deployment_watcher::DeploymentWatcher;
use crate::services::drain_coordinator::DrainCoordinator;
use crate::services::eval_broker::EvalBroker;
use crate::services::plan_applier::PlanApplier;
use crate::services::scheduler::{self, ScheduleOutcome};
use crate::services::worker::Worker;

/// In-process orchestrator: one `StateStore`, one broker, one applier, N
/// workers, and a dynamically-managed set of deployment watchers and drain
/// coordinators (one per active deployment / draining node).
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    broker: Arc<EvalBroker>,
    applier: Arc<PlanApplier>,
    config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    watcher_handles: Mutex<HashMap<DeploymentId, JoinHandle<()>>>,
    drain_handles: Mutex<HashMap<NodeId, JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds an orchestrator over `store`, restoring broker state from
    /// every non-terminal evaluation already in the store (spec.md §4.2
    /// "Durability" — covers a restart or a leader takeover).
    pub async fn new(config: OrchestratorConfig, store: Arc<dyn StateStore>) -> Self {
        let broker = Arc::new(EvalBroker::with_visibility_timeout(std::time::Duration::from_secs(
            config.broker.visibility_timeout_secs,
        )));
        let snapshot = store.snapshot().await;
        broker.restore(snapshot.list_pending_evaluations().await).await;

        let applier = Arc::new(PlanApplier::new(store.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            broker,
            applier,
            config,
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
            watcher_handles: Mutex::new(HashMap::new()),
            drain_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the configured worker pools and a watcher/coordinator for
    /// every deployment/draining node already in the store. Idempotent only
    /// in the sense that calling it twice spawns a second set of pools —
    /// callers call it once, right after `new`.
    pub async fn start(&self) {
        let mut handles = self.worker_handles.lock().await;
        for i in 0..self.config.worker.service_batch_workers {
            let worker = Worker::new(
                i,
                self.broker.clone(),
                self.store.clone(),
                self.applier.clone(),
                vec![crate::domain::models::JobType::Service, crate::domain::models::JobType::Batch],
            );
            handles.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
        }
        for i in 0..self.config.worker.system_workers {
            let worker = Worker::new(
                self.config.worker.service_batch_workers + i,
                self.broker.clone(),
                self.store.clone(),
                self.applier.clone(),
                vec![crate::domain::models::JobType::System],
            );
            handles.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
        }
        drop(handles);

        let snapshot = self.store.snapshot().await;
        for job in snapshot.list_jobs().await {
            for deployment in snapshot.list_deployments_by_job(&job.id).await {
                if !deployment.status.is_terminal() {
                    self.spawn_deployment_watcher(deployment.id, job.id.clone()).await;
                }
            }
        }
        for node in snapshot.list_nodes().await {
            if node.is_draining() {
                self.spawn_drain_coordinator(node.id.clone()).await;
            }
        }

        info!(
            workers = self.config.worker.service_batch_workers + self.config.worker.system_workers,
            "orchestrator started"
        );
    }

    /// Signals every long-lived task to stop and waits for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.worker_handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        for (_, handle) in self.watcher_handles.lock().await.drain() {
            let _ = handle.await;
        }
        for (_, handle) in self.drain_handles.lock().await.drain() {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }

    async fn spawn_deployment_watcher(&self, deployment_id: DeploymentId, job_id: JobId) {
        let watcher = DeploymentWatcher::new(deployment_id, job_id, self.store.clone(), self.broker.clone());
        let handle = tokio::spawn(watcher.run(self.shutdown_tx.subscribe()));
        self.watcher_handles.lock().await.insert(deployment_id, handle);
    }

    async fn spawn_drain_coordinator(&self, node_id: NodeId) {
        let coordinator = DrainCoordinator::new(node_id.clone(), self.store.clone(), self.broker.clone());
        let handle = tokio::spawn(coordinator.run(self.shutdown_tx.subscribe()));
        self.drain_handles.lock().await.insert(node_id, handle);
    }

    // ---- Job endpoints (spec.md §6) ----

    /// `RegisterJob`: persists the job (bumping `version` if one already
    /// exists) and enqueues a scheduling eval. `enforce_index`, when given,
    /// rejects the registration with `VersionConflict` unless it matches the
    /// job's current `modify_index` (0 for a job that doesn't exist yet) —
    /// the optimistic-concurrency guard against two racing registrations of
    /// the same job id silently clobbering each other.
    #[instrument(skip(self, job))]
    pub async fn register_job(&self, mut job: Job, enforce_index: Option<u64>) -> OrchestratorResult<(EvalId, u64)> {
        let snapshot = self.store.snapshot().await;
        let existing = snapshot.get_job(&job.id).await;

        if let Some(expected) = enforce_index {
            let actual = existing.as_ref().map_or(0, |j| j.modify_index);
            if actual != expected {
                return Err(OrchestratorError::VersionConflict { job_id: job.id.clone(), expected, actual });
            }
        }

        if let Some(existing) = existing {
            job.version = existing.version + 1;
            job.create_index = existing.create_index;
        } else {
            job.version = 0;
        }
        let index = self.store.apply(vec![WriteOp::PutJob(Box::new(job.clone()))]).await?;
        job.modify_index = index;

        let eval = new_eval(&job, TriggeredBy::JobRegister, index);
        self.persist_and_enqueue(eval.clone()).await?;
        Ok((eval.id, index))
    }

    /// `DeregisterJob`: tombstones the job (or deletes it outright when
    /// `purge` is set) and enqueues a deregister eval so the scheduler tears
    /// down any remaining allocations.
    pub async fn deregister_job(&self, job_id: JobId, purge: bool) -> OrchestratorResult<(EvalId, u64)> {
        let job = self
            .store
            .snapshot()
            .await
            .get_job(&job_id)
            .await
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;

        let index = if purge {
            self.store.apply(vec![WriteOp::DeleteJob(job_id.clone())]).await?
        } else {
            self.store.current_index()
        };

        let eval = new_eval(&job, TriggeredBy::JobDeregister, index);
        self.persist_and_enqueue(eval.clone()).await?;
        Ok((eval.id, index))
    }

    /// `EvaluateJob`: forces a fresh scheduling pass for a job without
    /// changing its spec (used after, e.g., a manual `force_reschedule`).
    pub async fn evaluate_job(&self, job_id: JobId) -> OrchestratorResult<(EvalId, u64)> {
        let job = self
            .store
            .snapshot()
            .await
            .get_job(&job_id)
            .await
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let index = self.store.current_index();
        let eval = new_eval(&job, TriggeredBy::Scheduled, index);
        self.persist_and_enqueue(eval.clone()).await?;
        Ok((eval.id, index))
    }

    /// `SetJobStability`: marks a job version as stable (or not), the flag
    /// `auto_revert` deployments read to decide what to roll back to.
    pub async fn set_job_stability(&self, job_id: JobId, version: u64, stable: bool) -> OrchestratorResult<u64> {
        let mut job = self
            .store
            .snapshot()
            .await
            .get_job(&job_id)
            .await
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        if job.version != version {
            return Err(OrchestratorError::InvalidJobSpec(format!(
                "job {job_id} is at version {}, not {version}",
                job.version
            )));
        }
        job.stable = stable;
        self.store.apply(vec![WriteOp::PutJob(Box::new(job))]).await.map_err(OrchestratorError::from)
    }

    /// `PlanJob`: computes the plan a registration of `job` would produce,
    /// without applying it or mutating the store — a dry run. `job` must
    /// already be registered, since the scheduler reads it (and the fleet's
    /// current allocations) through `snapshot.get_job`.
    pub async fn plan_job(&self, job: &Job) -> OrchestratorResult<ScheduleOutcome> {
        let snapshot = self.store.snapshot().await;
        let eval = new_eval(job, TriggeredBy::JobRegister, snapshot.index());
        Ok(scheduler::schedule(snapshot.as_ref(), &eval).await?)
    }

    // ---- Node endpoints ----

    /// `DrainNode`: sets (or clears) the node's `drainStrategy` and spawns
    /// (or leaves running) the corresponding `DrainCoordinator`. Clearing a
    /// drain restores eligibility and unblocks evals waiting on the node's
    /// class (spec.md §4.2: a node event that changes a class's capacity
    /// wakes up matching blocked evals).
    pub async fn drain_node(&self, node_id: NodeId, strategy: Option<DrainStrategy>) -> OrchestratorResult<u64> {
        let mut node = self.get_node(&node_id).await?;
        let class = node.class.clone();
        let is_draining = strategy.is_some();
        node.drain_strategy = strategy;
        if is_draining {
            node.scheduling_eligibility = SchedulingEligibility::Ineligible;
        } else {
            node.scheduling_eligibility = SchedulingEligibility::Eligible;
        }
        let index = self.store.apply(vec![WriteOp::PutNode(Box::new(node))]).await?;
        if is_draining {
            self.spawn_drain_coordinator(node_id).await;
        } else {
            self.broker.unblock_matching(&ClassEligibility(BTreeSet::from([class]))).await;
        }
        Ok(index)
    }

    /// `SetNodeEligibility`: unblocks evals waiting on the node's class when
    /// eligibility is restored (spec.md §4.2).
    pub async fn set_node_eligibility(&self, node_id: NodeId, eligibility: SchedulingEligibility) -> OrchestratorResult<u64> {
        let mut node = self.get_node(&node_id).await?;
        let class = node.class.clone();
        node.scheduling_eligibility = eligibility;
        let index = self.store.apply(vec![WriteOp::PutNode(Box::new(node))]).await?;
        if eligibility == SchedulingEligibility::Eligible {
            self.broker.unblock_matching(&ClassEligibility(BTreeSet::from([class]))).await;
        }
        Ok(index)
    }

    /// `EvaluateNode`: re-evaluates every job with a live allocation on
    /// `node_id` (used after a manual capacity or attribute change).
    pub async fn evaluate_node(&self, node_id: NodeId) -> OrchestratorResult<Vec<EvalId>> {
        let snapshot = self.store.snapshot().await;
        let index = snapshot.index();
        let mut job_ids: Vec<JobId> = snapshot
            .list_allocations_by_node(&node_id)
            .await
            .into_iter()
            .map(|a| a.job_id)
            .collect();
        job_ids.sort();
        job_ids.dedup();

        let mut eval_ids = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            if let Some(job) = snapshot.get_job(&job_id).await {
                let mut eval = new_eval(&job, TriggeredBy::NodeUpdate, index);
                eval.node_id = Some(node_id.clone());
                self.persist_and_enqueue(eval.clone()).await?;
                eval_ids.push(eval.id);
            }
        }
        Ok(eval_ids)
    }

    /// `PurgeNode`: re-evaluates every job with a live allocation on
    /// `node_id` (so the next scheduling pass replaces them elsewhere), then
    /// removes the node row outright.
    pub async fn purge_node(&self, node_id: NodeId) -> OrchestratorResult<Vec<EvalId>> {
        self.get_node(&node_id).await?;
        let eval_ids = self.evaluate_node(node_id.clone()).await?;
        self.store.apply(vec![WriteOp::DeleteNode(node_id)]).await?;
        Ok(eval_ids)
    }

    async fn get_node(&self, node_id: &NodeId) -> OrchestratorResult<Node> {
        self.store
            .snapshot()
            .await
            .get_node(node_id)
            .await
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.clone()))
    }

    // ---- Deployment endpoints ----

    pub async fn promote_deployment(&self, deployment_id: DeploymentId, groups: &[String]) -> Result<(), DeploymentError> {
        let watcher = self.deployment_watcher(deployment_id).await?;
        watcher.promote(groups).await
    }

    pub async fn pause_deployment(&self, deployment_id: DeploymentId) -> Result<(), DeploymentError> {
        self.deployment_watcher(deployment_id).await?.pause().await
    }

    pub async fn resume_deployment(&self, deployment_id: DeploymentId) -> Result<(), DeploymentError> {
        self.deployment_watcher(deployment_id).await?.resume().await
    }

    /// `FailDeployment`: force-transitions a deployment to `failed`,
    /// bypassing the watcher's own health-driven failure path. The watcher
    /// task (if one is running for this deployment) picks up the change on
    /// its next `StateStore::watch` notification and stops producing evals.
    pub async fn fail_deployment(&self, deployment_id: DeploymentId) -> OrchestratorResult<()> {
        let mut deployment = self
            .store
            .snapshot()
            .await
            .get_deployment(&deployment_id)
            .await
            .ok_or(DeploymentError::NotFound(deployment_id))?;
        if deployment.status.is_terminal() {
            return Err(DeploymentError::AlreadyTerminal(deployment_id).into());
        }
        deployment.status = crate::domain::models::DeploymentStatus::Failed;
        deployment.status_description = "failed by operator".to_string();
        self.store.apply(vec![WriteOp::PutDeployment(Box::new(deployment))]).await?;
        Ok(())
    }

    /// `SetAllocHealth`: reports allocation health for a deployment's
    /// canary/rollout tracking, driving `min_healthy_time`/auto-promote.
    pub async fn set_alloc_health(
        &self,
        healthy: &[crate::domain::models::AllocId],
        unhealthy: &[crate::domain::models::AllocId],
    ) -> Result<(), DeploymentError> {
        for &alloc_id in healthy {
            crate::services::deployment_watcher::mark_allocation_health(self.store.as_ref(), alloc_id, true).await?;
        }
        for &alloc_id in unhealthy {
            crate::services::deployment_watcher::mark_allocation_health(self.store.as_ref(), alloc_id, false).await?;
        }
        Ok(())
    }

    async fn deployment_watcher(&self, deployment_id: DeploymentId) -> Result<DeploymentWatcher, DeploymentError> {
        let deployment = self
            .store
            .snapshot()
            .await
            .get_deployment(&deployment_id)
            .await
            .ok_or(DeploymentError::NotFound(deployment_id))?;
        Ok(DeploymentWatcher::new(deployment_id, deployment.job_id, self.store.clone(), self.broker.clone()))
    }

    // ---- Eval read endpoints ----

    pub async fn list_evaluations(&self) -> Vec<Evaluation> {
        self.store.snapshot().await.list_pending_evaluations().await
    }

    pub async fn read_evaluation(&self, eval_id: EvalId) -> Option<Evaluation> {
        self.store.snapshot().await.get_evaluation(&eval_id).await
    }

    async fn persist_and_enqueue(&self, eval: Evaluation) -> OrchestratorResult<()> {
        self.store.apply(vec![WriteOp::PutEvaluation(Box::new(eval.clone()))]).await?;
        self.broker.enqueue(eval).await;
        Ok(())
    }
}

fn new_eval(job: &Job, triggered_by: TriggeredBy, snapshot_index: u64) -> Evaluation {
    Evaluation {
        id: EvalId::new(),
        priority: job.priority,
        job_type: job.job_type,
        namespace: job.namespace.clone(),
        triggered_by,
        job_id: job.id.clone(),
        job_modify_index: job.modify_index,
        node_id: None,
        status: EvalStatus::Pending,
        status_description: String::new(),
        wait_until: None,
        previous_eval: None,
        next_eval: None,
        blocked_eval: None,
        failed_tg_allocs: vec![],
        class_eligibility: ClassEligibility::default(),
        snapshot_index: Some(snapshot_index),
        create_index: 0,
        modify_index: 0,
    }
}
