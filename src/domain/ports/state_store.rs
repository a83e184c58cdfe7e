//! The `StateStore` port: the only interface the core has onto the
//! replicated log. Production deployments back this with a real Raft FSM;
//! this crate ships [`crate::adapters::memory_store::MemoryStateStore`] and
//! [`crate::adapters::sqlite_store::SqliteStateStore`] as reference adapters
//! (spec.md §4.1 treats the real log as an external collaborator).

use async_trait::async_trait;

use crate::domain::error::StateStoreError;
use crate::domain::models::{Allocation, Deployment, Evaluation, Job, Node};

/// Tables the core reads and writes through the store. Used to scope
/// `Watch` subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Jobs,
    Nodes,
    Allocations,
    Evaluations,
    Deployments,
}

/// A single mutation within an apply batch. The applier and the job/node
/// endpoints build these; `StateStore::apply` commits a `Vec<WriteOp>`
/// atomically at one new index.
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutJob(Box<Job>),
    DeleteJob(crate::domain::models::JobId),
    PutNode(Box<Node>),
    DeleteNode(crate::domain::models::NodeId),
    PutAllocation(Box<Allocation>),
    PutEvaluation(Box<Evaluation>),
    DeleteEvaluation(crate::domain::models::EvalId),
    PutDeployment(Box<Deployment>),
}

/// An internally-consistent read-only view at some index `<=` the leader
/// index. Reads against a `ReadView` never observe a partial write.
#[async_trait]
pub trait ReadView: Send + Sync {
    fn index(&self) -> u64;

    async fn get_job(&self, id: &crate::domain::models::JobId) -> Option<Job>;
    async fn list_jobs(&self) -> Vec<Job>;
    async fn get_node(&self, id: &crate::domain::models::NodeId) -> Option<Node>;
    async fn list_nodes(&self) -> Vec<Node>;
    async fn list_allocations_by_job(&self, id: &crate::domain::models::JobId) -> Vec<Allocation>;
    async fn list_allocations_by_node(&self, id: &crate::domain::models::NodeId) -> Vec<Allocation>;
    async fn get_allocation(&self, id: &crate::domain::models::AllocId) -> Option<Allocation>;
    async fn get_deployment(&self, id: &crate::domain::models::DeploymentId) -> Option<Deployment>;
    async fn list_deployments_by_job(&self, id: &crate::domain::models::JobId) -> Vec<Deployment>;
    async fn get_evaluation(&self, id: &crate::domain::models::EvalId) -> Option<Evaluation>;
    async fn list_pending_evaluations(&self) -> Vec<Evaluation>;
}

/// A change notification delivered to `Watch` subscribers. Carries only the
/// table and the new index — subscribers re-read through a fresh snapshot,
/// matching the "no in-memory back-pointers" design note.
#[derive(Debug, Clone, Copy)]
pub struct WatchEvent {
    pub table: Table,
    pub index: u64,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// An internally-consistent read snapshot at or before the leader index.
    async fn snapshot(&self) -> Box<dyn ReadView>;

    /// Apply a batch of writes as one linearizable transaction. Returns the
    /// new index on success.
    async fn apply(&self, batch: Vec<WriteOp>) -> Result<u64, StateStoreError>;

    /// Subscribe to changes on the given tables from `from_index` onward.
    fn watch(&self, tables: &[Table]) -> tokio::sync::broadcast::Receiver<WatchEvent>;

    fn current_index(&self) -> u64;
}
