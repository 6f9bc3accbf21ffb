//! Database models mapping to the staging schema.

use serde::Serialize;
use sqlx::FromRow;
use stager_core::{ReplicaId, ReplicaOrigin, ReplicaStatus, StageStatus, TaskId, TaskStatus};
use time::OffsetDateTime;

// =============================================================================
// Tasks
// =============================================================================

/// Task record: one staging batch submitted by a consumer.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskRow {
    pub task_id: TaskId,
    pub source: String,
    pub callback_method: String,
    pub source_task_id: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submit_time: OffsetDateTime,
    /// Set only when the task reaches `Done`.
    #[serde(with = "time::serde::rfc3339::option")]
    pub complete_time: Option<OffsetDateTime>,
}

impl TaskRow {
    /// Parse the stored status.
    pub fn task_status(&self) -> stager_core::Result<TaskStatus> {
        self.status.parse()
    }
}

// =============================================================================
// Cache replicas
// =============================================================================

/// Cache replica record: one (storage element, LFN) pair.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CacheReplicaRow {
    pub replica_id: ReplicaId,
    pub replica_type: String,
    pub status: String,
    pub se: String,
    pub lfn: String,
    /// Physical file name, empty until resolved.
    pub pfn: String,
    pub size: i64,
    pub file_checksum: String,
    pub guid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submit_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    pub reason: Option<String>,
    /// Number of task links referencing this replica.
    pub links: i64,
}

impl CacheReplicaRow {
    pub fn replica_status(&self) -> stager_core::Result<ReplicaStatus> {
        self.status.parse()
    }
}

// =============================================================================
// Stage requests
// =============================================================================

/// One outstanding or completed stage request for a replica.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StageRequestRow {
    pub replica_id: ReplicaId,
    /// Handle assigned by the storage backend.
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub stage_request_submit_time: OffsetDateTime,
    /// Requested pin duration in seconds.
    pub pin_length: i64,
    pub stage_status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub stage_request_completed_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pin_expiry_time: Option<OffsetDateTime>,
}

impl StageRequestRow {
    pub fn status(&self) -> stager_core::Result<StageStatus> {
        self.stage_status.parse()
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Result of resolving one LFN at a storage element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedReplica {
    pub replica_id: ReplicaId,
    pub origin: ReplicaOrigin,
}

/// A `Waiting` replica ready to be submitted for staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingReplica {
    pub lfn: String,
    pub se: String,
    pub size: i64,
    pub pfn: String,
}

/// A replica joined to its stage request, used both while polling for
/// completion and while pinning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestedReplica {
    pub lfn: String,
    pub se: String,
    pub pfn: String,
    pub size: i64,
    pub request_id: String,
}

/// Pin usage at a single storage element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagePinUsage {
    pub replicas: u64,
    pub total_size: u64,
}

/// Per-replica line of a task summary.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskReplicaSummary {
    pub replica_id: ReplicaId,
    pub lfn: String,
    pub se: String,
    pub pfn: String,
    pub size: i64,
    pub status: String,
    pub reason: Option<String>,
}

/// A task together with every replica linked to it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task: TaskRow,
    pub replicas: Vec<TaskReplicaSummary>,
}
