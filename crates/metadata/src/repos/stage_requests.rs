//! Stage request tracker repository.

use crate::error::MetadataResult;
use crate::models::{RequestedReplica, StageRequestRow};
use async_trait::async_trait;
use stager_core::{PinExpiryPolicy, ReplicaId};
use std::collections::BTreeMap;

/// Repository for stage requests issued to storage backends.
#[async_trait]
pub trait StageRequestRepo: Send + Sync {
    /// Record stage requests: one row per (replica, backend request id).
    ///
    /// `requests` maps each backend request id to the replicas it covers.
    /// In the same transaction, covered replicas still in `Waiting` move to
    /// `StageSubmitted`. Returns the number of rows inserted.
    async fn insert_stage_request(
        &self,
        requests: &BTreeMap<String, Vec<ReplicaId>>,
        pin_lifetime_secs: u64,
    ) -> MetadataResult<u64>;

    /// Get `StageSubmitted` replicas joined to their stage requests.
    async fn get_stage_submitted_replicas(
        &self,
    ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>>;

    /// Mark the stage requests of the given replicas complete.
    ///
    /// Sets the completion time and derives the pin expiry from `policy`.
    /// In the same transaction, the replicas move from `StageSubmitted` to
    /// `Staged`. Returns the number of stage request rows updated.
    async fn set_stage_complete(
        &self,
        replica_ids: &[ReplicaId],
        policy: PinExpiryPolicy,
    ) -> MetadataResult<u64>;

    /// Get `Staged` replicas joined to their stage requests.
    async fn get_staged_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>>;

    /// Get the stage request rows of the given replicas.
    async fn get_stage_requests(
        &self,
        replica_ids: &[ReplicaId],
    ) -> MetadataResult<Vec<StageRequestRow>>;
}
