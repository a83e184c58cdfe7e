//! Handlers for each CLI subcommand. Each takes the shared `Orchestrator`
//! and prints either a `comfy-table` table or, with `--json`, the raw
//! `serde_json` value — mirroring the teacher's `cli/commands::*::handle_*`
//! functions.

use std::path::Path;

use anyhow::{Context, Result};

use crate::app::Orchestrator;
use crate::cli::output;
use crate::cli::{DeploymentCommands, EligibilityArg, EvalCommands, JobCommands, NodeCommands};
use crate::domain::models::{AllocId, DeploymentId, DrainStrategy, EvalId, Job, JobId, NodeId, SchedulingEligibility};

fn parse_uuid_id<T: From<uuid::Uuid>>(raw: &str, kind: &str) -> Result<T> {
    let uuid = uuid::Uuid::parse_str(raw).with_context(|| format!("invalid {kind} id: {raw}"))?;
    Ok(T::from(uuid))
}

fn load_job(path: &Path) -> Result<Job> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing job spec from {}", path.display()))
}

pub async fn handle_job(orch: &Orchestrator, cmd: JobCommands, json: bool) -> Result<()> {
    match cmd {
        JobCommands::Register { file, enforce_index } => {
            let job = load_job(&file)?;
            let (eval_id, index) = orch.register_job(job, enforce_index).await?;
            print_eval_ack(eval_id, index, json);
        }
        JobCommands::Deregister { job_id, purge } => {
            let (eval_id, index) = orch.deregister_job(JobId::new(job_id), purge).await?;
            print_eval_ack(eval_id, index, json);
        }
        JobCommands::Evaluate { job_id } => {
            let (eval_id, index) = orch.evaluate_job(JobId::new(job_id)).await?;
            print_eval_ack(eval_id, index, json);
        }
        JobCommands::SetStability { job_id, version, stable } => {
            let index = orch.set_job_stability(JobId::new(job_id), version, stable).await?;
            print_index_ack(index, json);
        }
        JobCommands::Plan { file } => {
            let job = load_job(&file)?;
            let outcome = orch.plan_job(&job).await?;
            if json {
                println!("{}", serde_json::json!({
                    "blocked": outcome.is_blocked(),
                    "placements": outcome.plan.node_allocations.len(),
                    "stops": outcome.plan.node_updates.len(),
                }));
            } else if outcome.is_blocked() {
                println!("plan is BLOCKED:");
                println!("{}", output::failed_tg_alloc_table(&outcome.failed_tg_allocs));
            } else {
                println!(
                    "plan places allocations on {} node(s), stops on {} node(s)",
                    outcome.plan.node_allocations.len(),
                    outcome.plan.node_updates.len()
                );
            }
        }
    }
    Ok(())
}

pub async fn handle_node(orch: &Orchestrator, cmd: NodeCommands, json: bool) -> Result<()> {
    match cmd {
        NodeCommands::Drain {
            node_id,
            deadline_secs,
            ignore_system_jobs,
            force_deadline,
            mark_eligible_on_complete,
        } => {
            let strategy = DrainStrategy {
                deadline: chrono::Utc::now() + chrono::Duration::seconds(deadline_secs),
                ignore_system_jobs,
                force_deadline,
                mark_eligible_on_complete,
            };
            let index = orch.drain_node(NodeId::new(node_id), Some(strategy)).await?;
            print_index_ack(index, json);
        }
        NodeCommands::Undrain { node_id } => {
            let index = orch.drain_node(NodeId::new(node_id), None).await?;
            print_index_ack(index, json);
        }
        NodeCommands::Eligibility { node_id, eligibility } => {
            let eligibility = match eligibility {
                EligibilityArg::Eligible => SchedulingEligibility::Eligible,
                EligibilityArg::Ineligible => SchedulingEligibility::Ineligible,
            };
            let index = orch.set_node_eligibility(NodeId::new(node_id), eligibility).await?;
            print_index_ack(index, json);
        }
        NodeCommands::Evaluate { node_id } => {
            let eval_ids = orch.evaluate_node(NodeId::new(node_id)).await?;
            if json {
                println!("{}", serde_json::json!({ "evals": eval_ids.iter().map(ToString::to_string).collect::<Vec<_>>() }));
            } else {
                println!("enqueued {} evaluation(s)", eval_ids.len());
            }
        }
        NodeCommands::Purge { node_id } => {
            let eval_ids = orch.purge_node(NodeId::new(node_id)).await?;
            if json {
                println!("{}", serde_json::json!({ "evals": eval_ids.iter().map(ToString::to_string).collect::<Vec<_>>() }));
            } else {
                println!("node purged, enqueued {} evaluation(s)", eval_ids.len());
            }
        }
    }
    Ok(())
}

pub async fn handle_deployment(orch: &Orchestrator, cmd: DeploymentCommands, json: bool) -> Result<()> {
    match cmd {
        DeploymentCommands::Promote { deployment_id, groups } => {
            let id: DeploymentId = parse_uuid_id(&deployment_id, "deployment")?;
            orch.promote_deployment(id, &groups).await?;
            ok(json);
        }
        DeploymentCommands::Pause { deployment_id } => {
            let id: DeploymentId = parse_uuid_id(&deployment_id, "deployment")?;
            orch.pause_deployment(id).await?;
            ok(json);
        }
        DeploymentCommands::Resume { deployment_id } => {
            let id: DeploymentId = parse_uuid_id(&deployment_id, "deployment")?;
            orch.resume_deployment(id).await?;
            ok(json);
        }
        DeploymentCommands::Fail { deployment_id } => {
            let id: DeploymentId = parse_uuid_id(&deployment_id, "deployment")?;
            orch.fail_deployment(id).await?;
            ok(json);
        }
        DeploymentCommands::AllocHealth { healthy, unhealthy } => {
            let healthy: Vec<AllocId> = healthy.iter().map(|raw| parse_uuid_id(raw, "allocation")).collect::<Result<_>>()?;
            let unhealthy: Vec<AllocId> = unhealthy.iter().map(|raw| parse_uuid_id(raw, "allocation")).collect::<Result<_>>()?;
            orch.set_alloc_health(&healthy, &unhealthy).await?;
            ok(json);
        }
    }
    Ok(())
}

pub async fn handle_eval(orch: &Orchestrator, cmd: EvalCommands, json: bool) -> Result<()> {
    match cmd {
        EvalCommands::List => {
            let evals = orch.list_evaluations().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&evals)?);
            } else {
                println!("{}", output::eval_table(&evals));
            }
        }
        EvalCommands::Read { eval_id } => {
            let id: EvalId = parse_uuid_id(&eval_id, "evaluation")?;
            match orch.read_evaluation(id).await {
                Some(eval) if json => println!("{}", serde_json::to_string_pretty(&eval)?),
                Some(eval) => println!("{}", output::eval_table(std::slice::from_ref(&eval))),
                None => println!("evaluation {eval_id} not found"),
            }
        }
    }
    Ok(())
}

fn print_eval_ack(eval_id: EvalId, index: u64, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "eval_id": eval_id.to_string(), "index": index }));
    } else {
        println!("eval {eval_id} enqueued at index {index}");
    }
}

fn print_index_ack(index: u64, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "index": index }));
    } else {
        println!("applied at index {index}");
    }
}

fn ok(json: bool) {
    if json {
        println!("{}", serde_json::json!({ "ok": true }));
    } else {
        println!("ok");
    }
}
