//! Domain models: pure entities with no infrastructure concerns.
//!
//! Cross-entity references here are always by id (see `ids.rs`) — entities
//! are always looked up fresh from the `StateStore`, never held as in-memory
//! back-pointers.

pub mod allocation;
pub mod deployment;
pub mod evaluation;
pub mod ids;
pub mod job;
pub mod node;
pub mod plan;

pub use allocation::{
    compute_delay, Allocation, AllocMetrics, ClientStatus, DeploymentAllocStatus, DeploymentHealth,
    DesiredStatus, RescheduleEvent, RescheduleTracker, TaskState,
};
pub use deployment::{Deployment, DeploymentStatus, TaskGroupDeploymentState};
pub use evaluation::{
    ClassEligibility, EvalStatus, Evaluation, FailedTGAlloc, TriggeredBy,
};
pub use ids::{AllocId, DeploymentId, EvalId, JobId, NodeId};
pub use job::{
    Affinity, Constraint, ConstraintOperator, DelayFunction, EphemeralDisk, EphemeralDiskMode,
    Job, JobType, MigratePolicy, ReschedulePolicy, ResourceRequest, RestartPolicy, Spread,
    TaskGroup, UpdatePolicy,
};
pub use node::{
    DrainStrategy, DriverHealth, Node, NodeResources, NodeStatus, SchedulingEligibility,
};
pub use plan::{AllocUpdate, DeploymentUpdate, Plan, PlanResult};
