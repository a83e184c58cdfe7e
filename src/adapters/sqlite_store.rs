//! SQLite-backed [`StateStore`] adapter.
//!
//! Demonstrates that the scheduling core is indifferent to the storage
//! backend behind the port: every row is a JSON blob in a generic
//! `state_rows` table, written inside one `sqlx` transaction per `apply`
//! call so the batch commits atomically, matching the teacher's
//! `DatabaseConnection` (WAL mode, busy timeout, pooled connections)
//! conventions in `infrastructure/database`.
//!
//! Reads materialize a full [`ReadView`] snapshot per call rather than
//! querying lazily; this keeps `ReadView` internally consistent without a
//! second locking layer on top of SQLite, at the cost of being unsuitable
//! for the hot scheduling path on a large fleet (hence `MemoryStateStore`
//! is the default there — see `DESIGN.md`).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use tokio::sync::broadcast;

use crate::domain::error::StateStoreError;
use crate::domain::models::{
    Allocation, AllocId, Deployment, DeploymentId, EvalId, Evaluation, Job, JobId, Node, NodeId,
};
use crate::domain::ports::state_store::{ReadView, StateStore, Table, WatchEvent, WriteOp};

impl Table {
    const fn name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Nodes => "nodes",
            Self::Allocations => "allocations",
            Self::Evaluations => "evaluations",
            Self::Deployments => "deployments",
        }
    }
}

pub struct SqliteStateStore {
    pool: SqlitePool,
    changes: broadcast::Sender<WatchEvent>,
    index_cache: std::sync::atomic::AtomicU64,
}

impl SqliteStateStore {
    /// Open (creating if missing) a SQLite-backed state store and run
    /// migrations. `database_url` is a `sqlx` sqlite URL, e.g.
    /// `sqlite:.clusterd/state.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StateStoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StateStoreError::Backend(format!("invalid database url: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StateStoreError::Backend(format!("migration failed: {e}"))
        })?;

        let row: (i64,) = sqlx::query_as("SELECT current_index FROM state_meta WHERE id = 1")
            .fetch_one(&pool)
            .await?;

        let (changes, _) = broadcast::channel(1024);
        Ok(Self {
            pool,
            changes,
            index_cache: std::sync::atomic::AtomicU64::new(row.0 as u64),
        })
    }

    async fn put_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        table: Table,
        id: &str,
        data: &impl serde::Serialize,
        index: i64,
    ) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(data)?;
        sqlx::query(
            "INSERT INTO state_rows (table_name, id, data, create_index, modify_index)
             VALUES (?1, ?2, ?3, COALESCE((SELECT create_index FROM state_rows WHERE table_name = ?1 AND id = ?2), ?4), ?4)
             ON CONFLICT(table_name, id) DO UPDATE SET data = excluded.data, modify_index = excluded.modify_index",
        )
        .bind(table.name())
        .bind(id)
        .bind(json)
        .bind(index)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        table: Table,
        id: &str,
    ) -> Result<(), StateStoreError> {
        sqlx::query("DELETE FROM state_rows WHERE table_name = ?1 AND id = ?2")
            .bind(table.name())
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, StateStoreError> {
        let rows = sqlx::query("SELECT data FROM state_rows WHERE table_name = ?1")
            .bind(table.name())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let data: String = r.get("data");
                serde_json::from_str(&data).map_err(StateStoreError::from)
            })
            .collect()
    }
}

struct SqliteSnapshot {
    index: u64,
    jobs: HashMap<JobId, Job>,
    nodes: HashMap<NodeId, Node>,
    allocations: HashMap<AllocId, Allocation>,
    evaluations: HashMap<EvalId, Evaluation>,
    deployments: HashMap<DeploymentId, Deployment>,
}

#[async_trait]
impl ReadView for SqliteSnapshot {
    fn index(&self) -> u64 {
        self.index
    }

    async fn get_job(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).cloned()
    }

    async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.values().cloned().collect()
    }

    async fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).cloned()
    }

    async fn list_nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    async fn list_allocations_by_job(&self, id: &JobId) -> Vec<Allocation> {
        self.allocations.values().filter(|a| &a.job_id == id).cloned().collect()
    }

    async fn list_allocations_by_node(&self, id: &NodeId) -> Vec<Allocation> {
        self.allocations.values().filter(|a| &a.node_id == id).cloned().collect()
    }

    async fn get_allocation(&self, id: &AllocId) -> Option<Allocation> {
        self.allocations.get(id).cloned()
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Option<Deployment> {
        self.deployments.get(id).cloned()
    }

    async fn list_deployments_by_job(&self, id: &JobId) -> Vec<Deployment> {
        self.deployments.values().filter(|d| &d.job_id == id).cloned().collect()
    }

    async fn get_evaluation(&self, id: &EvalId) -> Option<Evaluation> {
        self.evaluations.get(id).cloned()
    }

    async fn list_pending_evaluations(&self) -> Vec<Evaluation> {
        use crate::domain::models::EvalStatus;
        self.evaluations
            .values()
            .filter(|e| matches!(e.status, EvalStatus::Pending | EvalStatus::Blocked))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn snapshot(&self) -> Box<dyn ReadView> {
        let index = self.current_index();
        let jobs: Vec<Job> = self.list(Table::Jobs).await.unwrap_or_default();
        let nodes: Vec<Node> = self.list(Table::Nodes).await.unwrap_or_default();
        let allocations: Vec<Allocation> = self.list(Table::Allocations).await.unwrap_or_default();
        let evaluations: Vec<Evaluation> = self.list(Table::Evaluations).await.unwrap_or_default();
        let deployments: Vec<Deployment> = self.list(Table::Deployments).await.unwrap_or_default();

        Box::new(SqliteSnapshot {
            index,
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            allocations: allocations.into_iter().map(|a| (a.id, a)).collect(),
            evaluations: evaluations.into_iter().map(|e| (e.id, e)).collect(),
            deployments: deployments.into_iter().map(|d| (d.id, d)).collect(),
        })
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<u64, StateStoreError> {
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as("SELECT current_index FROM state_meta WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;
        let new_index = row.0 + 1;

        let mut touched = Vec::new();
        for op in batch {
            match op {
                WriteOp::PutJob(job) => {
                    touched.push(Table::Jobs);
                    Self::put_row(&mut tx, Table::Jobs, &job.id.0, &job, new_index).await?;
                }
                WriteOp::DeleteJob(id) => {
                    touched.push(Table::Jobs);
                    Self::delete_row(&mut tx, Table::Jobs, &id.0).await?;
                }
                WriteOp::PutNode(node) => {
                    touched.push(Table::Nodes);
                    Self::put_row(&mut tx, Table::Nodes, &node.id.0, &node, new_index).await?;
                }
                WriteOp::DeleteNode(id) => {
                    touched.push(Table::Nodes);
                    Self::delete_row(&mut tx, Table::Nodes, &id.0).await?;
                }
                WriteOp::PutAllocation(alloc) => {
                    touched.push(Table::Allocations);
                    Self::put_row(&mut tx, Table::Allocations, &alloc.id.to_string(), &alloc, new_index).await?;
                }
                WriteOp::PutEvaluation(eval) => {
                    touched.push(Table::Evaluations);
                    Self::put_row(&mut tx, Table::Evaluations, &eval.id.to_string(), &eval, new_index).await?;
                }
                WriteOp::DeleteEvaluation(id) => {
                    touched.push(Table::Evaluations);
                    Self::delete_row(&mut tx, Table::Evaluations, &id.to_string()).await?;
                }
                WriteOp::PutDeployment(dep) => {
                    touched.push(Table::Deployments);
                    Self::put_row(&mut tx, Table::Deployments, &dep.id.to_string(), &dep, new_index).await?;
                }
            }
        }

        sqlx::query("UPDATE state_meta SET current_index = ?1 WHERE id = 1")
            .bind(new_index)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.index_cache.store(new_index as u64, std::sync::atomic::Ordering::SeqCst);

        touched.sort_by_key(|t| *t as u8);
        touched.dedup_by_key(|t| *t as u8);
        for table in touched {
            let _ = self.changes.send(WatchEvent {
                table,
                index: new_index as u64,
            });
        }

        Ok(new_index as u64)
    }

    fn watch(&self, _tables: &[Table]) -> broadcast::Receiver<WatchEvent> {
        self.changes.subscribe()
    }

    fn current_index(&self) -> u64 {
        self.index_cache.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{JobType, NodeResources, NodeStatus, SchedulingEligibility};
    use chrono::Utc;

    #[tokio::test]
    async fn apply_persists_and_snapshot_reads_back() {
        let store = SqliteStateStore::connect("sqlite::memory:").await.unwrap();

        let node = Node {
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
            create_index: 0,
            modify_index: 0,
        };

        let idx = store.apply(vec![WriteOp::PutNode(Box::new(node))]).await.unwrap();
        assert_eq!(idx, 1);

        let snap = store.snapshot().await;
        assert_eq!(snap.index(), 1);
        assert!(snap.get_node(&NodeId::new("n1")).await.is_some());

        let job = Job {
            id: JobId::new("job1"),
            namespace: "default".into(),
            region: "global".into(),
            job_type: JobType::Batch,
            priority: 10,
            datacenters: vec!["dc1".into()],
            groups: vec![],
            version: 0,
            stable: false,
            create_index: 2,
            modify_index: 2,
        };
        store.apply(vec![WriteOp::PutJob(Box::new(job))]).await.unwrap();
        let snap2 = store.snapshot().await;
        assert_eq!(snap2.list_jobs().await.len(), 1);
    }
}
