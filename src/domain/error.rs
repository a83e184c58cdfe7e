//! Domain error types for the cluster orchestrator core.
//!
//! Each component gets its own error enum so callers can match on the
//! failure modes that are actually relevant to them; [`OrchestratorError`]
//! composes all of them for call sites that just need to propagate with `?`.

use thiserror::Error;

use crate::domain::models::{AllocId, DeploymentId, EvalId, JobId, NodeId};

/// Errors raised by a [`crate::domain::ports::StateStore`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    /// A concurrent writer changed the row's index between read and apply.
    #[error("transaction conflict on {table}/{id}: expected index {expected}, found {actual}")]
    TxnConflict {
        table: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    /// This replica is not the leader and cannot accept writes.
    #[error("not leader")]
    NotLeader,

    /// A read was served from a snapshot older than the caller required.
    #[error("stale read: requested index {requested}, have {have}")]
    StaleRead { requested: u64, have: u64 },

    /// No row exists for the given key.
    #[error("{table} row not found: {id}")]
    NotFound { table: &'static str, id: String },

    /// Opaque backend failure (I/O, serialization, pool exhaustion).
    #[error("state store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StateStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StateStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors raised while evaluating a scheduling placement.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No feasible node could be found for one or more placements; the eval
    /// should be marked `blocked` rather than treated as a hard failure.
    #[error("infeasible placement for job {job_id}, group {group}: {reason}")]
    Infeasible {
        job_id: JobId,
        group: String,
        reason: String,
    },

    /// The scheduler exhausted its plan-apply retry budget.
    #[error("max plan attempts ({0}) exceeded")]
    MaxPlanAttemptsExceeded(u32),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

/// Errors raised by the [`crate::services::eval_broker::EvalBroker`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("eval {0} not found in broker")]
    UnknownEval(EvalId),

    #[error("ack/nack token for eval {0} does not match the outstanding delivery")]
    TokenMismatch(EvalId),

    #[error("eval {0} already acknowledged")]
    AlreadyAcked(EvalId),

    #[error("broker is closed")]
    Closed,
}

/// Errors raised by the [`crate::services::drain_coordinator::DrainCoordinator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("node {0} has no active drain strategy")]
    NotDraining(NodeId),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

/// Errors raised by the [`crate::services::deployment_watcher::DeploymentWatcher`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("deployment {0} not found")]
    NotFound(DeploymentId),

    #[error("deployment {0} is already terminal")]
    AlreadyTerminal(DeploymentId),

    #[error("task group {group} is not part of deployment {deployment_id}")]
    UnknownGroup {
        deployment_id: DeploymentId,
        group: String,
    },

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

/// Crate-wide error used by the `Orchestrator` facade and the CLI boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("job {job_id} registration conflict: enforce_index {expected} does not match current modify index {actual}")]
    VersionConflict { job_id: JobId, expected: u64, actual: u64 },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("allocation {0} not found")]
    AllocationNotFound(AllocId),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
