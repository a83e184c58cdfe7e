//! Ambient stack: configuration loading and logging setup. Nothing in
//! `domain` or `services` depends on this module; only `main` and the CLI
//! boundary do.

pub mod config;
pub mod logging;

pub use config::{ConfigError, OrchestratorConfig};
