//! Ports: interfaces the core depends on, implemented by adapters.
//!
//! Hexagonal-architecture seam — the scheduling, rollout, and drain logic in
//! `services/` depends only on [`StateStore`], never on a concrete adapter.

pub mod state_store;

pub use state_store::{ReadView, StateStore, Table, WatchEvent, WriteOp};
