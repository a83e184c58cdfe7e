//! Scheduling workers: the pool that drains the [`EvalBroker`], runs the
//! scheduler, and submits the resulting plan through the [`PlanApplier`]
//! (spec.md §4.3, §9). Each worker owns no state of its own — everything it
//! touches is either the broker or the `StateStore`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::domain::models::{EvalStatus, JobType};
use crate::domain::ports::state_store::{StateStore, WriteOp};
use crate::services::eval_broker::EvalBroker;
use crate::services::plan_applier::PlanApplier;
use crate::services::{reschedule, scheduler};

const DEQUEUE_POLL: Duration = Duration::from_secs(1);

/// One scheduling worker's configuration: which job types it services. A
/// real deployment runs separate pools for `service`/`batch` and `system`
/// so a flood of system evals can't starve service scheduling.
pub struct Worker {
    id: usize,
    broker: Arc<EvalBroker>,
    store: Arc<dyn StateStore>,
    applier: Arc<PlanApplier>,
    scheduler_types: Vec<JobType>,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: usize,
        broker: Arc<EvalBroker>,
        store: Arc<dyn StateStore>,
        applier: Arc<PlanApplier>,
        scheduler_types: Vec<JobType>,
    ) -> Self {
        Self {
            id,
            broker,
            store,
            applier,
            scheduler_types,
        }
    }

    /// Runs until `shutdown` fires. Each loop iteration dequeues one eval
    /// (blocking up to [`DEQUEUE_POLL`]), schedules it, applies the plan, and
    /// acks/nacks based on the outcome — a panic inside scheduling is caught
    /// and turned into a nack rather than taking the worker down.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.id, "scheduling worker started");
        loop {
            tokio::select! {
                () = async {
                    if let Some((eval, token)) = self.broker.dequeue(&self.scheduler_types, DEQUEUE_POLL).await {
                        self.process(eval, token).await;
                    }
                } => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = self.id, "scheduling worker stopped");
    }

    #[instrument(skip(self, token), fields(worker_id = self.id, eval_id = %eval.id))]
    async fn process(&self, eval: crate::domain::models::Evaluation, token: uuid::Uuid) {
        let _ = self.broker.pause_nack_timeout(eval.id, token).await;

        let snapshot = self.store.snapshot().await;
        let outcome = AssertUnwindSafe(scheduler::schedule(snapshot.as_ref(), &eval))
            .catch_unwind()
            .await;

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!(error = %err, "scheduling failed");
                let _ = self.broker.resume_nack_timeout(eval.id, token).await;
                let _ = self.broker.nack(eval.id, token).await;
                return;
            }
            Err(_) => {
                error!("scheduler panicked");
                let _ = self.broker.resume_nack_timeout(eval.id, token).await;
                let _ = self.broker.nack(eval.id, token).await;
                return;
            }
        };

        let blocked = outcome.is_blocked();
        let job = self.store.snapshot().await.get_job(&eval.job_id).await;

        if !outcome.plan.is_empty() || outcome.deployment.is_some() {
            if let Err(err) = self.applier.apply(outcome.plan, outcome.deployment).await {
                error!(error = %err, "plan application failed");
                let _ = self.broker.resume_nack_timeout(eval.id, token).await;
                let _ = self.broker.nack(eval.id, token).await;
                return;
            }
        }

        if let Some(job) = &job {
            for (alloc_id, wait_until) in outcome.delayed_reschedules {
                let follow_up = reschedule::follow_up_eval(job, alloc_id, wait_until, &eval);
                let _ = self.store.apply(vec![WriteOp::PutEvaluation(Box::new(follow_up.clone()))]).await;
                self.broker.enqueue(follow_up).await;
            }
        }

        let mut final_eval = eval.clone();
        final_eval.failed_tg_allocs = outcome.failed_tg_allocs;

        if blocked {
            final_eval.status = EvalStatus::Blocked;
            let classes = class_eligibility_for(&final_eval);
            let _ = self.store.apply(vec![WriteOp::PutEvaluation(Box::new(final_eval.clone()))]).await;
            if self.broker.block(eval.id, token, final_eval, classes).await.is_err() {
                warn!("failed to mark eval blocked in broker");
            }
        } else {
            final_eval.status = EvalStatus::Complete;
            let _ = self.store.apply(vec![WriteOp::PutEvaluation(Box::new(final_eval))]).await;
            let _ = self.broker.resume_nack_timeout(eval.id, token).await;
            if self.broker.ack(eval.id, token).await.is_err() {
                warn!("failed to ack eval in broker");
            }
        }
    }
}

fn class_eligibility_for(eval: &crate::domain::models::Evaluation) -> crate::domain::models::ClassEligibility {
    use std::collections::BTreeSet;
    let classes: BTreeSet<String> = eval.failed_tg_allocs.iter().map(|f| f.task_group.clone()).collect();
    crate::domain::models::ClassEligibility(classes)
}
