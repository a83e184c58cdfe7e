//! Cluster workload orchestrator core: the scheduling pipeline, the
//! deployment/rollout engine, and the node drain/rescheduling coordinator,
//! laid out as domain (pure models + ports) / services (business logic) /
//! adapters (port implementations) / infrastructure (config + logging).

pub mod app;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub mod adapters;

pub use app::Orchestrator;
pub use domain::error::{OrchestratorError, OrchestratorResult};
