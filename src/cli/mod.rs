//! Command-line surface over an in-process [`crate::Orchestrator`]. A
//! convenience wrapper, not a distinct protocol — every subcommand just
//! calls the matching `Orchestrator` endpoint and renders the result with
//! `comfy-table`, matching the teacher's `cli/commands` + `cli/output`
//! split.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "clusterd", about = "Cluster workload orchestrator core", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Job lifecycle: register, deregister, evaluate, plan.
    #[command(subcommand)]
    Job(JobCommands),
    /// Node lifecycle: drain, eligibility, evaluate.
    #[command(subcommand)]
    Node(NodeCommands),
    /// Deployment control: promote, pause, resume, fail.
    #[command(subcommand)]
    Deployment(DeploymentCommands),
    /// Evaluation inspection: list, read.
    #[command(subcommand)]
    Eval(EvalCommands),
}

#[derive(Debug, Subcommand)]
pub enum JobCommands {
    /// Register a job spec read from a YAML file.
    Register {
        file: std::path::PathBuf,
        /// Reject the registration unless the job's current modify index
        /// matches (0 for a job that doesn't exist yet) — guards against a
        /// racing registration of the same job id.
        #[arg(long)]
        enforce_index: Option<u64>,
    },
    /// Deregister a job by id, optionally purging its store row.
    Deregister {
        job_id: String,
        #[arg(long)]
        purge: bool,
    },
    /// Force a fresh scheduling pass for an already-registered job.
    Evaluate { job_id: String },
    /// Mark a job version stable (or not), for deployment auto-revert.
    SetStability {
        job_id: String,
        version: u64,
        #[arg(long)]
        stable: bool,
    },
    /// Show the plan a registration of this spec would produce, without
    /// applying it.
    Plan { file: std::path::PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum NodeCommands {
    /// Start draining a node: stop workload as migrate policy allows, up to
    /// `deadline_secs` from now.
    Drain {
        node_id: String,
        #[arg(long, default_value_t = 3600)]
        deadline_secs: i64,
        #[arg(long)]
        ignore_system_jobs: bool,
        /// Skip graceful migration and force-stop immediately, without
        /// waiting for the deadline.
        #[arg(long)]
        force_deadline: bool,
        #[arg(long)]
        mark_eligible_on_complete: bool,
    },
    /// Clear an in-progress drain and restore scheduling eligibility.
    Undrain { node_id: String },
    /// Set scheduling eligibility directly.
    Eligibility {
        node_id: String,
        #[arg(value_enum)]
        eligibility: EligibilityArg,
    },
    /// Re-evaluate every job with an allocation on this node.
    Evaluate { node_id: String },
    /// Remove a node's store row after rescheduling its allocations
    /// elsewhere (for decommissioning a node that has already gone away).
    Purge { node_id: String },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum EligibilityArg {
    Eligible,
    Ineligible,
}

#[derive(Debug, Subcommand)]
pub enum DeploymentCommands {
    /// Promote canaries (or named groups) to unblock full rollout.
    Promote {
        deployment_id: String,
        /// Task group names to promote; omit to promote all groups.
        groups: Vec<String>,
    },
    Pause { deployment_id: String },
    Resume { deployment_id: String },
    Fail { deployment_id: String },
    /// Report allocation health for canary/rollout tracking.
    AllocHealth {
        #[arg(long = "healthy", value_delimiter = ',')]
        healthy: Vec<String>,
        #[arg(long = "unhealthy", value_delimiter = ',')]
        unhealthy: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EvalCommands {
    /// List all non-terminal evaluations.
    List,
    /// Show one evaluation by id.
    Read { eval_id: String },
}
