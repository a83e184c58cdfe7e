//! EvalBroker: priority-ordered, namespace-fair queue of pending
//! evaluations with at-least-once delivery (spec.md §4.2).
//!
//! The broker is in-memory and owned by the leader; on leader change a new
//! leader reconstructs it from the `StateStore` by calling [`EvalBroker::restore`]
//! with every non-terminal evaluation — no ack/nack state survives leader
//! change, which is fine because the eval row itself is durable.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::domain::error::BrokerError;
use crate::domain::models::{ClassEligibility, EvalId, EvalStatus, Evaluation, JobId, JobType};

/// Visibility timeout applied on dequeue; if the worker doesn't Ack/Nack in
/// this window the eval is requeued with a priority boost.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_NACK_BACKOFF: Duration = Duration::from_secs(300);
const PRIORITY_MAX: u8 = 100;

#[derive(Debug, Clone)]
struct ReadyEntry {
    eval: Evaluation,
    delivery_attempts: u32,
}

struct Delivery {
    eval: Evaluation,
    token: Uuid,
    deadline: chrono::DateTime<Utc>,
    paused: bool,
    delivery_attempts: u32,
}

#[derive(Eq, PartialEq)]
struct Delayed {
    wait_until: chrono::DateTime<Utc>,
    eval_id: EvalId,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest wait_until first.
        other.wait_until.cmp(&self.wait_until)
    }
}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    /// priority (descending) -> namespace -> FIFO queue of ready evals.
    ready: HashMap<u8, HashMap<String, VecDeque<ReadyEntry>>>,
    /// Round-robin cursor per priority level, for namespace fairness.
    rr_cursor: HashMap<u8, usize>,
    delivered: HashMap<EvalId, Delivery>,
    /// One active eval per job (ready or delivered); others wait here.
    active_job: HashMap<JobId, EvalId>,
    waiting: HashMap<JobId, VecDeque<Evaluation>>,
    delayed: BinaryHeap<Delayed>,
    delayed_evals: HashMap<EvalId, Evaluation>,
    blocked: HashMap<EvalId, (Evaluation, ClassEligibility)>,
}

pub struct EvalBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl EvalBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout: timeout,
        }
    }

    /// Rebuild broker state from every non-terminal evaluation in the store,
    /// after a leader change (spec.md §4.2 "Durability").
    pub async fn restore(&self, evals: Vec<Evaluation>) {
        let mut inner = self.inner.lock().await;
        for eval in evals {
            if matches!(eval.status, EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled) {
                continue;
            }
            if eval.is_delayed(Utc::now()) {
                Self::push_delayed(&mut inner, eval);
            } else if eval.status == EvalStatus::Blocked {
                let classes = eval.class_eligibility.clone();
                inner.blocked.insert(eval.id, (eval, classes));
            } else {
                Self::admit_ready(&mut inner, eval);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Accepts an eval. Returns `true` if it went straight to the ready set,
    /// `false` if it was queued (per-job wait list or delayed).
    pub async fn enqueue(&self, eval: Evaluation) -> bool {
        let mut inner = self.inner.lock().await;
        let admitted = Self::enqueue_locked(&mut inner, eval);
        drop(inner);
        if admitted {
            self.notify.notify_waiters();
        }
        admitted
    }

    fn enqueue_locked(inner: &mut Inner, eval: Evaluation) -> bool {
        if eval.is_delayed(Utc::now()) {
            Self::push_delayed(inner, eval);
            return false;
        }
        let job_id = eval.job_id.clone();
        if inner.active_job.contains_key(&job_id) {
            inner.waiting.entry(job_id).or_default().push_back(eval);
            return false;
        }
        inner.active_job.insert(job_id, eval.id);
        Self::admit_ready(inner, eval);
        true
    }

    fn push_delayed(inner: &mut Inner, eval: Evaluation) {
        let wait_until = eval.wait_until.unwrap_or_else(Utc::now);
        inner.delayed.push(Delayed {
            wait_until,
            eval_id: eval.id,
        });
        inner.delayed_evals.insert(eval.id, eval);
    }

    fn admit_ready(inner: &mut Inner, eval: Evaluation) {
        let priority = eval.priority;
        let namespace = eval.namespace.clone();
        inner
            .ready
            .entry(priority)
            .or_default()
            .entry(namespace)
            .or_default()
            .push_back(ReadyEntry {
                eval,
                delivery_attempts: 0,
            });
    }

    /// Promote any delayed evals whose `wait_until` has passed into ready.
    fn drain_delayed(inner: &mut Inner, now: chrono::DateTime<Utc>) {
        while let Some(top) = inner.delayed.peek() {
            if top.wait_until > now {
                break;
            }
            let entry = inner.delayed.pop().unwrap();
            if let Some(eval) = inner.delayed_evals.remove(&entry.eval_id) {
                let job_id = eval.job_id.clone();
                if inner.active_job.contains_key(&job_id) {
                    inner.waiting.entry(job_id).or_default().push_back(eval);
                } else {
                    inner.active_job.insert(job_id, eval.id);
                    Self::admit_ready(inner, eval);
                }
            }
        }
    }

    /// Requeue any delivery whose visibility timeout has expired, with a
    /// priority boost (capped at 100).
    fn sweep_expired(inner: &mut Inner, now: chrono::DateTime<Utc>) {
        let expired: Vec<EvalId> = inner
            .delivered
            .iter()
            .filter(|(_, d)| !d.paused && d.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(delivery) = inner.delivered.remove(&id) {
                let mut eval = delivery.eval;
                eval.priority = eval.priority.saturating_add(1).min(PRIORITY_MAX);
                inner
                    .ready
                    .entry(eval.priority)
                    .or_default()
                    .entry(eval.namespace.clone())
                    .or_default()
                    .push_back(ReadyEntry {
                        eval,
                        delivery_attempts: delivery.delivery_attempts,
                    });
            }
        }
    }

    fn pop_ready_locked(inner: &mut Inner, scheduler_types: &[JobType]) -> Option<ReadyEntry> {
        let mut priorities: Vec<u8> = inner.ready.keys().copied().collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));

        for priority in priorities {
            let Some(namespaces) = inner.ready.get_mut(&priority) else { continue };
            let mut names: Vec<String> = namespaces.keys().cloned().collect();
            names.sort();
            if names.is_empty() {
                continue;
            }
            let cursor = inner.rr_cursor.entry(priority).or_insert(0);
            let n = names.len();
            for step in 0..n {
                let idx = (*cursor + step) % n;
                let ns = &names[idx];
                if let Some(queue) = namespaces.get_mut(ns) {
                    if let Some(pos) = queue
                        .iter()
                        .position(|e| scheduler_types.is_empty() || scheduler_types.contains(&e.eval.job_type))
                    {
                        let entry = queue.remove(pos).unwrap();
                        *cursor = (idx + 1) % n;
                        if queue.is_empty() {
                            namespaces.remove(ns);
                        }
                        return Some(entry);
                    }
                }
            }
        }
        None
    }

    /// Blocks up to `timeout` for the highest-priority eligible eval.
    pub async fn dequeue(&self, scheduler_types: &[JobType], timeout: Duration) -> Option<(Evaluation, Uuid)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut inner = self.inner.lock().await;
            let now = Utc::now();
            Self::drain_delayed(&mut inner, now);
            Self::sweep_expired(&mut inner, now);

            if let Some(entry) = Self::pop_ready_locked(&mut inner, scheduler_types) {
                let token = Uuid::new_v4();
                let eval_id = entry.eval.id;
                inner.delivered.insert(
                    eval_id,
                    Delivery {
                        eval: entry.eval.clone(),
                        token,
                        deadline: now + chrono::Duration::from_std(self.visibility_timeout).unwrap(),
                        paused: false,
                        delivery_attempts: entry.delivery_attempts + 1,
                    },
                );
                return Some((entry.eval, token));
            }
            drop(inner);

            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let poll = remaining.min(Duration::from_millis(100));
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Marks delivery successful; releases the per-job slot and promotes a
    /// waiting eval for the same job, if any.
    pub async fn ack(&self, eval_id: EvalId, token: Uuid) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let delivery = inner.delivered.get(&eval_id).ok_or(BrokerError::UnknownEval(eval_id))?;
        if delivery.token != token {
            return Err(BrokerError::TokenMismatch(eval_id));
        }
        let delivery = inner.delivered.remove(&eval_id).unwrap();
        let job_id = delivery.eval.job_id.clone();
        inner.active_job.remove(&job_id);

        if let Some(queue) = inner.waiting.get_mut(&job_id) {
            if let Some(next) = queue.pop_front() {
                if queue.is_empty() {
                    inner.waiting.remove(&job_id);
                }
                Self::enqueue_locked(&mut inner, next);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Returns the eval to the ready set with backoff proportional to the
    /// number of delivery attempts, capped at [`MAX_NACK_BACKOFF`].
    pub async fn nack(&self, eval_id: EvalId, token: Uuid) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let delivery = inner.delivered.get(&eval_id).ok_or(BrokerError::UnknownEval(eval_id))?;
        if delivery.token != token {
            return Err(BrokerError::TokenMismatch(eval_id));
        }
        let delivery = inner.delivered.remove(&eval_id).unwrap();
        let backoff = Duration::from_secs(2u64.saturating_pow(delivery.delivery_attempts.min(8)))
            .min(MAX_NACK_BACKOFF);
        let mut eval = delivery.eval;
        eval.wait_until = Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap());
        let job_id = eval.job_id.clone();
        inner.active_job.remove(&job_id);
        Self::push_delayed(&mut inner, eval);
        // Keep the job's active slot pointed at the delayed retry so other
        // evals for the same job still queue behind it.
        inner.active_job.insert(job_id, eval_id);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Freezes the visibility timer while a worker is actively computing.
    pub async fn pause_nack_timeout(&self, eval_id: EvalId, token: Uuid) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let delivery = inner.delivered.get_mut(&eval_id).ok_or(BrokerError::UnknownEval(eval_id))?;
        if delivery.token != token {
            return Err(BrokerError::TokenMismatch(eval_id));
        }
        delivery.paused = true;
        Ok(())
    }

    pub async fn resume_nack_timeout(&self, eval_id: EvalId, token: Uuid) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let delivery = inner.delivered.get_mut(&eval_id).ok_or(BrokerError::UnknownEval(eval_id))?;
        if delivery.token != token {
            return Err(BrokerError::TokenMismatch(eval_id));
        }
        delivery.paused = false;
        delivery.deadline = Utc::now() + chrono::Duration::from_std(self.visibility_timeout).unwrap();
        Ok(())
    }

    /// Marks an eval blocked with a class-eligibility fingerprint, removing
    /// it from active delivery tracking.
    pub async fn block(&self, eval_id: EvalId, token: Uuid, mut eval: Evaluation, classes: ClassEligibility) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let delivery = inner.delivered.get(&eval_id).ok_or(BrokerError::UnknownEval(eval_id))?;
        if delivery.token != token {
            return Err(BrokerError::TokenMismatch(eval_id));
        }
        inner.delivered.remove(&eval_id);
        let job_id = eval.job_id.clone();
        inner.active_job.remove(&job_id);
        eval.status = EvalStatus::Blocked;
        eval.class_eligibility = classes.clone();
        inner.blocked.insert(eval_id, (eval, classes));

        if let Some(queue) = inner.waiting.get_mut(&job_id) {
            if let Some(next) = queue.pop_front() {
                if queue.is_empty() {
                    inner.waiting.remove(&job_id);
                }
                Self::enqueue_locked(&mut inner, next);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Re-enqueues blocked evals whose fingerprint intersects `classes`
    /// (spec.md §9 "Blocked-eval unblocking").
    pub async fn unblock_matching(&self, classes: &ClassEligibility) -> usize {
        let mut inner = self.inner.lock().await;
        let matching: Vec<EvalId> = inner
            .blocked
            .iter()
            .filter(|(_, (_, c))| c.intersects(classes))
            .map(|(id, _)| *id)
            .collect();
        let count = matching.len();
        for id in matching {
            if let Some((eval, _)) = inner.blocked.remove(&id) {
                Self::enqueue_locked(&mut inner, eval);
            }
        }
        drop(inner);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    pub async fn len_ready(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.ready.values().flat_map(|ns| ns.values()).map(VecDeque::len).sum()
    }

    pub async fn len_blocked(&self) -> usize {
        self.inner.lock().await.blocked.len()
    }
}

impl Default for EvalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ClassEligibility, EvalStatus, TriggeredBy};
    use std::collections::BTreeSet;

    fn eval(job: &str, namespace: &str, priority: u8) -> Evaluation {
        Evaluation {
            id: EvalId::new(),
            priority,
            job_type: JobType::Service,
            namespace: namespace.into(),
            triggered_by: TriggeredBy::JobRegister,
            job_id: JobId::new(job),
            job_modify_index: 0,
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

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let broker = EvalBroker::new();
        broker.enqueue(eval("a", "default", 10)).await;
        broker.enqueue(eval("b", "default", 90)).await;

        let (first, _) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.job_id, JobId::new("b"));
    }

    #[tokio::test]
    async fn same_job_second_eval_waits_until_ack() {
        let broker = EvalBroker::new();
        broker.enqueue(eval("a", "default", 50)).await;
        let second_admitted = broker.enqueue(eval("a", "default", 50)).await;
        assert!(!second_admitted);

        let (first, token) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        assert!(broker.dequeue(&[], Duration::from_millis(50)).await.is_none());

        broker.ack(first.id, token).await.unwrap();
        let (second, _) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.job_id, JobId::new("a"));
    }

    #[tokio::test]
    async fn namespaces_round_robin_at_equal_priority() {
        let broker = EvalBroker::new();
        broker.enqueue(eval("a", "ns-a", 50)).await;
        broker.enqueue(eval("b", "ns-b", 50)).await;
        broker.enqueue(eval("c", "ns-a", 50)).await;

        let (e1, t1) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        broker.ack(e1.id, t1).await.unwrap();
        let (e2, t2) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        broker.ack(e2.id, t2).await.unwrap();

        let namespaces: BTreeSet<String> = [e1.namespace, e2.namespace].into_iter().collect();
        assert_eq!(namespaces.len(), 2, "both namespaces served before either repeats");
    }

    #[tokio::test]
    async fn nack_requeues_with_backoff_and_boosts_on_visibility_timeout() {
        let broker = EvalBroker::with_visibility_timeout(Duration::from_millis(10));
        broker.enqueue(eval("a", "default", 50)).await;
        let (first, _token) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.priority, 50);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (requeued, _) = broker.dequeue(&[], Duration::from_millis(200)).await.unwrap();
        assert_eq!(requeued.priority, 51, "visibility timeout expiry boosts priority");
    }

    #[tokio::test]
    async fn blocked_eval_unblocks_on_matching_class() {
        let broker = EvalBroker::new();
        broker.enqueue(eval("a", "default", 50)).await;
        let (e, token) = broker.dequeue(&[], Duration::from_millis(50)).await.unwrap();

        let mut classes = BTreeSet::new();
        classes.insert("class-a".to_string());
        broker.block(e.id, token, e.clone(), ClassEligibility(classes.clone())).await.unwrap();
        assert_eq!(broker.len_blocked().await, 1);

        let mut other = BTreeSet::new();
        other.insert("class-b".to_string());
        assert_eq!(broker.unblock_matching(&ClassEligibility(other)).await, 0);

        assert_eq!(broker.unblock_matching(&ClassEligibility(classes)).await, 1);
        assert_eq!(broker.len_blocked().await, 0);
        assert!(broker.dequeue(&[], Duration::from_millis(50)).await.is_some());
    }
}
