//! Services: the reactive, stateful components that sit between the domain
//! ports and the CLI — eval brokering, scheduling workers, plan application,
//! deployment health tracking, and node drain coordination.

pub mod deployment_watcher;
pub mod drain_coordinator;
pub mod eval_broker;
pub mod plan_applier;
pub mod reschedule;
pub mod scheduler;
pub mod worker;

pub use eval_broker::EvalBroker;
pub use plan_applier::PlanApplier;
