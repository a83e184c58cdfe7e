//! Builds follow-up evaluations for allocations the reconciler found failed
//! but not yet due for reschedule (spec.md §4.8). The delay math itself
//! lives on [`crate::domain::models::compute_delay`]; this module only wires
//! a reconcile pass's `delayed` output back into the eval broker.

use chrono::{DateTime, Utc};

use crate::domain::models::{AllocId, EvalId, Evaluation, EvalStatus, Job, TriggeredBy};

/// Builds the follow-up [`Evaluation`] for one delayed reschedule, to be
/// enqueued via [`crate::services::eval_broker::EvalBroker::enqueue`]. The
/// broker itself defers admission until `wait_until` elapses.
#[must_use]
pub fn follow_up_eval(job: &Job, alloc_id: AllocId, wait_until: DateTime<Utc>, origin: &Evaluation) -> Evaluation {
    Evaluation {
        id: EvalId::new(),
        priority: job.priority,
        job_type: job.job_type,
        namespace: job.namespace.clone(),
        triggered_by: TriggeredBy::FailedFollowUp,
        job_id: job.id.clone(),
        job_modify_index: job.modify_index,
        node_id: None,
        status: EvalStatus::Pending,
        status_description: format!("reschedule follow-up for allocation {alloc_id}"),
        wait_until: Some(wait_until),
        previous_eval: Some(origin.id),
        next_eval: None,
        blocked_eval: None,
        failed_tg_allocs: vec![],
        class_eligibility: crate::domain::models::ClassEligibility::default(),
        snapshot_index: None,
        create_index: 0,
        modify_index: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AllocId, ClassEligibility, JobId, JobType};

    fn sample_job() -> Job {
        Job {
            id: JobId::new("web"),
            namespace: "default".into(),
            region: "global".into(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".into()],
            groups: vec![],
            version: 0,
            stable: true,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn sample_eval() -> Evaluation {
        Evaluation {
            id: EvalId::new(),
            priority: 50,
            job_type: JobType::Service,
            namespace: "default".into(),
            triggered_by: TriggeredBy::Scheduled,
            job_id: JobId::new("web"),
            job_modify_index: 1,
            node_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: None,
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            failed_tg_allocs: vec![],
            class_eligibility: ClassEligibility::default(),
            snapshot_index: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn follow_up_carries_wait_until_and_origin() {
        let job = sample_job();
        let origin = sample_eval();
        let wait_until = Utc::now() + chrono::Duration::seconds(30);
        let follow_up = follow_up_eval(&job, AllocId::new(), wait_until, &origin);

        assert_eq!(follow_up.wait_until, Some(wait_until));
        assert_eq!(follow_up.previous_eval, Some(origin.id));
        assert_eq!(follow_up.triggered_by, TriggeredBy::FailedFollowUp);
    }
}
