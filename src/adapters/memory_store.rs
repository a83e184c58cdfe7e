//! In-memory [`StateStore`] adapter.
//!
//! Single-writer-through-a-lock, multi-reader snapshot semantics: every
//! mutation takes the write lock, bumps the monotone index, and clones the
//! resulting tables into an `Arc` so concurrently-held snapshots never see a
//! partial write. This is the default adapter for tests and for running the
//! core as a single-node demo; a real deployment swaps it for a Raft-backed
//! adapter without the `services` layer changing — the same swap the
//! teacher's `TaskQueueService` port supports across its `sqlite` and
//! in-memory repository adapters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::domain::error::StateStoreError;
use crate::domain::models::{
    Allocation, AllocId, Deployment, DeploymentId, EvalId, Evaluation, Job, JobId, Node, NodeId,
};
use crate::domain::ports::state_store::{ReadView, StateStore, Table, WatchEvent, WriteOp};

#[derive(Debug, Default, Clone)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    nodes: HashMap<NodeId, Node>,
    allocations: HashMap<AllocId, Allocation>,
    evaluations: HashMap<EvalId, Evaluation>,
    deployments: HashMap<DeploymentId, Deployment>,
}

pub struct MemoryStateStore {
    tables: RwLock<Arc<Tables>>,
    index: AtomicU64,
    changes: broadcast::Sender<WatchEvent>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            tables: RwLock::new(Arc::new(Tables::default())),
            index: AtomicU64::new(0),
            changes,
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySnapshot {
    tables: Arc<Tables>,
    index: u64,
}

#[async_trait]
impl ReadView for MemorySnapshot {
    fn index(&self) -> u64 {
        self.index
    }

    async fn get_job(&self, id: &JobId) -> Option<Job> {
        self.tables.jobs.get(id).cloned()
    }

    async fn list_jobs(&self) -> Vec<Job> {
        self.tables.jobs.values().cloned().collect()
    }

    async fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.tables.nodes.get(id).cloned()
    }

    async fn list_nodes(&self) -> Vec<Node> {
        self.tables.nodes.values().cloned().collect()
    }

    async fn list_allocations_by_job(&self, id: &JobId) -> Vec<Allocation> {
        self.tables
            .allocations
            .values()
            .filter(|a| &a.job_id == id)
            .cloned()
            .collect()
    }

    async fn list_allocations_by_node(&self, id: &NodeId) -> Vec<Allocation> {
        self.tables
            .allocations
            .values()
            .filter(|a| &a.node_id == id)
            .cloned()
            .collect()
    }

    async fn get_allocation(&self, id: &AllocId) -> Option<Allocation> {
        self.tables.allocations.get(id).cloned()
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Option<Deployment> {
        self.tables.deployments.get(id).cloned()
    }

    async fn list_deployments_by_job(&self, id: &JobId) -> Vec<Deployment> {
        self.tables
            .deployments
            .values()
            .filter(|d| &d.job_id == id)
            .cloned()
            .collect()
    }

    async fn get_evaluation(&self, id: &EvalId) -> Option<Evaluation> {
        self.tables.evaluations.get(id).cloned()
    }

    async fn list_pending_evaluations(&self) -> Vec<Evaluation> {
        use crate::domain::models::EvalStatus;
        self.tables
            .evaluations
            .values()
            .filter(|e| matches!(e.status, EvalStatus::Pending | EvalStatus::Blocked))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn snapshot(&self) -> Box<dyn ReadView> {
        let guard = self.tables.read().await;
        Box::new(MemorySnapshot {
            tables: Arc::clone(&guard),
            index: self.index.load(Ordering::SeqCst),
        })
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<u64, StateStoreError> {
        let mut guard = self.tables.write().await;
        let mut next = (**guard).clone();
        let mut touched = Vec::new();

        for op in batch {
            match op {
                WriteOp::PutJob(job) => {
                    touched.push(Table::Jobs);
                    next.jobs.insert(job.id.clone(), *job);
                }
                WriteOp::DeleteJob(id) => {
                    touched.push(Table::Jobs);
                    next.jobs.remove(&id);
                }
                WriteOp::PutNode(node) => {
                    touched.push(Table::Nodes);
                    next.nodes.insert(node.id.clone(), *node);
                }
                WriteOp::DeleteNode(id) => {
                    touched.push(Table::Nodes);
                    next.nodes.remove(&id);
                }
                WriteOp::PutAllocation(alloc) => {
                    touched.push(Table::Allocations);
                    next.allocations.insert(alloc.id, *alloc);
                }
                WriteOp::PutEvaluation(eval) => {
                    touched.push(Table::Evaluations);
                    next.evaluations.insert(eval.id, *eval);
                }
                WriteOp::DeleteEvaluation(id) => {
                    touched.push(Table::Evaluations);
                    next.evaluations.remove(&id);
                }
                WriteOp::PutDeployment(dep) => {
                    touched.push(Table::Deployments);
                    next.deployments.insert(dep.id, *dep);
                }
            }
        }

        let new_index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        *guard = Arc::new(next);
        drop(guard);

        touched.sort_by_key(|t| *t as u8);
        touched.dedup_by_key(|t| *t as u8);
        for table in touched {
            let _ = self.changes.send(WatchEvent {
                table,
                index: new_index,
            });
        }

        Ok(new_index)
    }

    fn watch(&self, _tables: &[Table]) -> broadcast::Receiver<WatchEvent> {
        self.changes.subscribe()
    }

    fn current_index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        JobType, NodeResources, NodeStatus, SchedulingEligibility,
    };
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn sample_node(id: &str) -> Node {
        Node {
            id: NodeId::new(id),
            datacenter: "dc1".into(),
            class: "default".into(),
            attributes: Map::new(),
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
            drivers: Map::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain_strategy: None,
            last_heartbeat: Utc::now(),
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test]
    async fn apply_bumps_index_and_is_visible_in_new_snapshot() {
        let store = MemoryStateStore::new();
        let before = store.snapshot().await;
        assert_eq!(before.index(), 0);

        let idx = store
            .apply(vec![WriteOp::PutNode(Box::new(sample_node("n1")))])
            .await
            .unwrap();
        assert_eq!(idx, 1);

        let after = store.snapshot().await;
        assert_eq!(after.index(), 1);
        assert!(after.get_node(&NodeId::new("n1")).await.is_some());
        // the earlier snapshot is unaffected by the later write
        assert!(before.get_node(&NodeId::new("n1")).await.is_none());
    }

    #[tokio::test]
    async fn watchers_receive_one_event_per_touched_table() {
        let store = MemoryStateStore::new();
        let mut rx = store.watch(&[Table::Nodes, Table::Jobs]);

        store
            .apply(vec![
                WriteOp::PutNode(Box::new(sample_node("n1"))),
                WriteOp::PutJob(Box::new(Job {
                    id: JobId::new("job1"),
                    namespace: "default".into(),
                    region: "global".into(),
                    job_type: JobType::Service,
                    priority: 50,
                    datacenters: vec!["dc1".into()],
                    groups: vec![],
                    version: 0,
                    stable: false,
                    create_index: 1,
                    modify_index: 1,
                })),
            ])
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.try_recv().unwrap().table);
        }
        assert!(rx.try_recv().is_err());
        assert!(seen.contains(&Table::Nodes));
        assert!(seen.contains(&Table::Jobs));
    }
}
