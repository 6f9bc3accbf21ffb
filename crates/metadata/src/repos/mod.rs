//! Repository traits for staging metadata operations.

pub mod links;
pub mod replicas;
pub mod stage_requests;
pub mod tasks;

pub use links::LinkRepo;
pub use replicas::{
    LinkCheckMode, LinkCheckReport, LinkDiscrepancy, ReplicaFilter, ReplicaOrderBy, ReplicaQuery,
    ReplicaRepo, ReplicaResolution, ReplicaTimestamp,
};
pub use stage_requests::StageRequestRepo;
pub use tasks::TaskRepo;
