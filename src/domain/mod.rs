//! Domain layer: pure entities, ports, and the error taxonomy.
//!
//! No `tokio`, `sqlx`, or `tracing` types appear in `models` — only
//! `ports` and `services` (outside this module) touch infrastructure
//! concerns, keeping the domain testable without a runtime.

pub mod error;
pub mod models;
pub mod ports;
