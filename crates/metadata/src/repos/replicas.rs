//! Replica cache repository.

use crate::error::MetadataResult;
use crate::models::{CacheReplicaRow, ResolvedReplica, StagePinUsage, WaitingReplica};
use async_trait::async_trait;
use serde::Serialize;
use stager_core::{ReplicaId, ReplicaStatus, TaskId};
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;

/// Repository for cache replica operations.
#[async_trait]
pub trait ReplicaRepo: Send + Sync {
    /// Resolve LFNs at a storage element to cache replicas, creating the
    /// ones that do not exist yet.
    ///
    /// Existing rows are found with one batched read. Missing rows are
    /// inserted `New` with an empty PFN, zero size and no links. If a
    /// concurrent caller inserts the same (SE, LFN) first, the row is
    /// re-read and reported as `Existing` rather than failing.
    async fn resolve_or_create(
        &self,
        se: &str,
        lfns: &[String],
        replica_type: &str,
    ) -> MetadataResult<HashMap<String, ResolvedReplica>>;

    /// Record resolved physical locations and sizes, moving replicas to
    /// `Waiting`.
    ///
    /// Only replicas still in `New` (or already `Waiting`) are touched; a
    /// cancelled or failed replica keeps its status, PFN and size.
    /// Returns the number of replicas updated.
    async fn update_replica_information(
        &self,
        entries: &[ReplicaResolution],
    ) -> MetadataResult<u64>;

    /// Mark replicas `Failed` with a reason, whatever their current status.
    async fn update_replica_failure(
        &self,
        failures: &BTreeMap<ReplicaId, String>,
    ) -> MetadataResult<u64>;

    /// Move replicas to `to` where the state machine allows it.
    ///
    /// Returns the ids that moved; replicas in any other status are left
    /// untouched.
    async fn update_replica_status(
        &self,
        replica_ids: &[ReplicaId],
        to: ReplicaStatus,
    ) -> MetadataResult<Vec<ReplicaId>>;

    /// Query cache replicas.
    ///
    /// A task filter is resolved to replica ids through the link table
    /// first and then applied like any other replica id filter.
    async fn get_cache_replicas(&self, query: &ReplicaQuery)
    -> MetadataResult<Vec<CacheReplicaRow>>;

    /// Get every replica in the given status.
    async fn get_replicas_with_status(
        &self,
        status: ReplicaStatus,
    ) -> MetadataResult<Vec<CacheReplicaRow>> {
        self.get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::with_status(status)))
            .await
    }

    /// Get `Waiting` replicas of tasks ready for stage submission.
    ///
    /// A task is ready only when none of its replicas is `New` or `Failed`.
    /// A replica shared by several tasks is returned if at least one of
    /// them is ready.
    async fn get_waiting_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, WaitingReplica>>;

    /// Count replicas holding pins, per storage element.
    async fn get_submitted_stage_pins(&self) -> MetadataResult<BTreeMap<String, StagePinUsage>>;

    /// Delete every replica with no links, together with its stage requests.
    ///
    /// Returns the ids of the deleted replicas.
    async fn remove_unlinked_replicas(&self) -> MetadataResult<Vec<ReplicaId>>;

    /// Compare each replica's stored link count against the link table.
    async fn verify_link_counts(&self, mode: LinkCheckMode) -> MetadataResult<LinkCheckReport>;
}

/// Resolved location of a replica, as reported by the file catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaResolution {
    pub replica_id: ReplicaId,
    pub pfn: String,
    pub size: i64,
}

impl ReplicaResolution {
    pub fn new(replica_id: ReplicaId, pfn: impl Into<String>, size: i64) -> Self {
        Self {
            replica_id,
            pfn: pfn.into(),
            size,
        }
    }
}

/// Attribute filter for cache replica queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReplicaFilter {
    pub replica_ids: Option<Vec<ReplicaId>>,
    /// Not a column of the replica table: resolved through task links.
    pub task_ids: Option<Vec<TaskId>>,
    pub statuses: Option<Vec<ReplicaStatus>>,
    pub se: Option<String>,
    pub lfns: Option<Vec<String>>,
    pub replica_type: Option<String>,
}

impl ReplicaFilter {
    pub fn with_status(status: ReplicaStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    pub fn for_tasks(task_ids: impl Into<Vec<TaskId>>) -> Self {
        Self {
            task_ids: Some(task_ids.into()),
            ..Self::default()
        }
    }

    /// Whether a list filter is present but empty, which matches no row.
    pub fn matches_nothing(&self) -> bool {
        self.replica_ids.as_ref().is_some_and(Vec::is_empty)
            || self.task_ids.as_ref().is_some_and(Vec::is_empty)
            || self.statuses.as_ref().is_some_and(Vec::is_empty)
            || self.lfns.as_ref().is_some_and(Vec::is_empty)
    }
}

/// Timestamp column used by the time window of a replica query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicaTimestamp {
    SubmitTime,
    #[default]
    LastUpdate,
}

impl ReplicaTimestamp {
    pub fn column(&self) -> &'static str {
        match self {
            Self::SubmitTime => "submit_time",
            Self::LastUpdate => "last_update",
        }
    }
}

/// Sort attribute of a replica query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOrderBy {
    ReplicaId,
    Lfn,
    Se,
    Status,
    Size,
    SubmitTime,
    LastUpdate,
}

impl ReplicaOrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            Self::ReplicaId => "replica_id",
            Self::Lfn => "lfn",
            Self::Se => "se",
            Self::Status => "status",
            Self::Size => "size",
            Self::SubmitTime => "submit_time",
            Self::LastUpdate => "last_update",
        }
    }
}

/// Cache replica query: filter, optional time window, ordering and limit.
#[derive(Debug, Clone, Default)]
pub struct ReplicaQuery {
    pub filter: ReplicaFilter,
    /// Only rows whose timestamp is strictly before this instant.
    pub older_than: Option<OffsetDateTime>,
    /// Only rows whose timestamp is strictly after this instant.
    pub newer_than: Option<OffsetDateTime>,
    pub timestamp: ReplicaTimestamp,
    /// Defaults to replica id order.
    pub order_by: Option<ReplicaOrderBy>,
    pub descending: bool,
    pub limit: Option<u32>,
}

impl ReplicaQuery {
    pub fn new(filter: ReplicaFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Resolve the effective replica id filter given the replicas linked to
    /// the filtered tasks.
    pub(crate) fn effective_replica_ids(
        &self,
        linked: Option<&std::collections::BTreeSet<ReplicaId>>,
    ) -> Option<Vec<ReplicaId>> {
        match (self.filter.replica_ids.as_ref(), linked) {
            (Some(ids), Some(linked)) => Some(
                ids.iter()
                    .copied()
                    .filter(|id| linked.contains(id))
                    .collect(),
            ),
            (Some(ids), None) => Some(ids.clone()),
            (None, Some(linked)) => Some(linked.iter().copied().collect()),
            (None, None) => None,
        }
    }
}

/// Whether link verification only reports or also repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCheckMode {
    /// Report discrepancies without modifying.
    DryRun,
    /// Rewrite stored counts to match the link table.
    Correct,
}

/// A replica whose stored link count disagrees with the link table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkDiscrepancy {
    pub replica_id: ReplicaId,
    pub stored_links: i64,
    pub computed_links: i64,
}

/// Outcome of a link verification pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkCheckReport {
    pub replicas_verified: u64,
    pub discrepancies: Vec<LinkDiscrepancy>,
    pub corrected: u64,
}
