//! End-to-end scenarios against an in-process `Orchestrator` over
//! `MemoryStateStore`: register a job onto a fleet with capacity, and the
//! capacity-exhaustion / unblock-on-new-node scenario.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clusterd::adapters::MemoryStateStore;
use clusterd::domain::models::{
    Constraint, DriverHealth, EphemeralDisk, Job, JobId, JobType, MigratePolicy, Node, NodeId,
    NodeResources, NodeStatus, ReschedulePolicy, ResourceRequest, RestartPolicy, SchedulingEligibility,
    Spread, TaskGroup, UpdatePolicy,
};
use clusterd::domain::ports::state_store::{StateStore, WriteOp};
use clusterd::infrastructure::config::OrchestratorConfig;
use clusterd::Orchestrator;

fn sample_node(id: &str, cpu_mhz: u64, memory_mb: u64) -> Node {
    Node {
        id: NodeId::new(id),
        datacenter: "dc1".into(),
        class: "default".into(),
        attributes: HashMap::new(),
        resources: NodeResources {
            cpu_mhz,
            memory_mb,
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
        drivers: HashMap::from([("docker".to_string(), DriverHealth { healthy: true, detected: true })]),
        status: NodeStatus::Ready,
        scheduling_eligibility: SchedulingEligibility::Eligible,
        drain_strategy: None,
        last_heartbeat: Utc::now(),
        create_index: 1,
        modify_index: 1,
    }
}

fn sample_job(id: &str, count: u32, memory_mb: u64) -> Job {
    Job {
        id: JobId::new(id),
        namespace: "default".into(),
        region: "global".into(),
        job_type: JobType::Service,
        priority: 50,
        datacenters: vec!["dc1".into()],
        groups: vec![TaskGroup {
            name: "web".into(),
            count,
            constraints: Vec::<Constraint>::new(),
            affinities: Vec::new(),
            spreads: Vec::<Spread>::new(),
            resources: ResourceRequest { cpu_mhz: 500, memory_mb, disk_mb: 100, network_ports: 0 },
            restart: RestartPolicy { attempts: 2, interval_secs: 600 },
            reschedule: ReschedulePolicy::default(),
            migrate: MigratePolicy::default(),
            update: UpdatePolicy::default(),
            ephemeral_disk: EphemeralDisk::default(),
        }],
        version: 0,
        stable: false,
        create_index: 0,
        modify_index: 0,
    }
}

async fn new_orchestrator() -> (Orchestrator, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::new());
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), store.clone()).await;
    orchestrator.start().await;
    (orchestrator, store)
}

#[tokio::test]
async fn placement_onto_fleet_with_capacity() {
    let (orchestrator, store) = new_orchestrator().await;
    store
        .apply(vec![WriteOp::PutNode(Box::new(sample_node("node-1", 4000, 8192)))])
        .await
        .unwrap();

    let (_eval_id, _index) = orchestrator.register_job(sample_job("web", 1, 512), None).await.unwrap();

    let mut placed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = store.snapshot().await;
        let allocs = snapshot.list_allocations_by_job(&JobId::new("web")).await;
        if !allocs.is_empty() {
            placed = true;
            break;
        }
    }
    assert!(placed, "expected an allocation to be placed within the poll window");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn capacity_exhaustion_blocks_then_unblocks_on_new_node() {
    let (orchestrator, store) = new_orchestrator().await;
    // Only a 32GB-equivalent node; job wants 64GB.
    store
        .apply(vec![WriteOp::PutNode(Box::new(sample_node("small", 8000, 32_768)))])
        .await
        .unwrap();

    let (eval_id, _index) = orchestrator.register_job(sample_job("big-mem", 1, 65_536), None).await.unwrap();

    let mut blocked = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(eval) = orchestrator.read_evaluation(eval_id).await {
            if eval.status == clusterd::domain::models::EvalStatus::Blocked {
                blocked = true;
                break;
            }
        }
    }
    assert!(blocked, "eval should be blocked: no node has enough memory");

    let allocs_before = store.snapshot().await.list_allocations_by_job(&JobId::new("big-mem")).await;
    assert!(allocs_before.is_empty(), "no allocation should be placed while blocked");

    // Add a node with enough capacity and force a fresh scheduling pass.
    store
        .apply(vec![WriteOp::PutNode(Box::new(sample_node("big", 16_000, 131_072)))])
        .await
        .unwrap();
    orchestrator.evaluate_job(JobId::new("big-mem")).await.unwrap();

    let mut placed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let allocs = store.snapshot().await.list_allocations_by_job(&JobId::new("big-mem")).await;
        if !allocs.is_empty() {
            placed = true;
            break;
        }
    }
    assert!(placed, "expected allocation after a node with sufficient capacity was added");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn rolling_update_respects_max_parallel_across_rounds() {
    let (orchestrator, store) = new_orchestrator().await;
    for i in 0..3 {
        store
            .apply(vec![WriteOp::PutNode(Box::new(sample_node(&format!("node-{i}"), 4000, 8192)))])
            .await
            .unwrap();
    }

    let mut job = sample_job("rolling", 3, 512);
    job.groups[0].update.max_parallel = 1;
    orchestrator.register_job(job.clone(), None).await.unwrap();

    let mut initial_allocs = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        initial_allocs = store.snapshot().await.list_allocations_by_job(&JobId::new("rolling")).await;
        if initial_allocs.len() == 3 {
            break;
        }
    }
    assert_eq!(initial_allocs.len(), 3, "expected all three initial allocations to place");

    // Re-registering the same spec bumps the job version and starts a
    // destructive rolling update gated to one in-flight replacement at a
    // time by `max_parallel = 1`.
    orchestrator.register_job(job.clone(), None).await.unwrap();

    let mut new_version_allocs = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        new_version_allocs = store
            .snapshot()
            .await
            .list_allocations_by_job(&JobId::new("rolling"))
            .await
            .into_iter()
            .filter(|a| a.job_version == 1)
            .collect();
        if !new_version_allocs.is_empty() {
            break;
        }
    }
    assert_eq!(
        new_version_allocs.len(),
        1,
        "max_parallel = 1 should place exactly one new-version allocation in the first round"
    );

    let deployment = store
        .snapshot()
        .await
        .list_deployments_by_job(&JobId::new("rolling"))
        .await
        .into_iter()
        .find(|d| d.job_version == 1)
        .expect("destructive update should create a deployment");
    assert_eq!(
        deployment.task_groups["web"].placed_allocs, 1,
        "placed_allocs must be bumped exactly once per placement round, not double-counted"
    );

    // Mark the lone new allocation healthy, then keep forcing fresh
    // evaluations: a double-counted `placed_allocs` pins `in_flight` above
    // `max_parallel` forever and this second round never places.
    orchestrator.set_alloc_health(&[new_version_allocs[0].id], &[]).await.unwrap();

    let mut second_round_allocs = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.evaluate_job(JobId::new("rolling")).await.unwrap();
        second_round_allocs = store
            .snapshot()
            .await
            .list_allocations_by_job(&JobId::new("rolling"))
            .await
            .into_iter()
            .filter(|a| a.job_version == 1)
            .collect();
        if second_round_allocs.len() == 2 {
            break;
        }
    }
    assert_eq!(
        second_round_allocs.len(),
        2,
        "once the first replacement is healthy, the second round should place one more"
    );

    orchestrator.shutdown().await;
}
