//! Task to replica link repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use stager_core::{ReplicaId, TaskId};
use std::collections::BTreeSet;

/// Repository for the many-to-many association between tasks and cache
/// replicas.
///
/// Linking and unlinking are the only operations that change a replica's
/// `links` count. Implementations recompute the count from the association
/// table in the same transaction as the insert or delete, so it cannot
/// drift from the true number of links.
#[async_trait]
pub trait LinkRepo: Send + Sync {
    /// Link a task to a set of replicas.
    ///
    /// All rows are written in one transaction: either every association
    /// is committed or none is. Duplicate ids and already existing pairs
    /// are ignored. Fails with `MissingReplicas` if any replica was
    /// garbage collected after it was resolved.
    ///
    /// Returns the number of new associations.
    async fn link(&self, task_id: TaskId, replica_ids: &[ReplicaId]) -> MetadataResult<u64>;

    /// Get the distinct replicas linked to any of the given tasks.
    async fn replica_ids_for_tasks(&self, task_ids: &[TaskId])
    -> MetadataResult<BTreeSet<ReplicaId>>;

    /// Delete every association of the given tasks.
    ///
    /// Returns the number of associations removed.
    async fn unlink(&self, task_ids: &[TaskId]) -> MetadataResult<u64>;
}
