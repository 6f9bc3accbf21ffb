//! Test fixtures.

#![allow(dead_code)]

use stager_core::{ReplicaId, TaskId};
use stager_metadata::coordinator::FilesBySe;
use stager_metadata::models::CacheReplicaRow;
use stager_metadata::repos::{ReplicaFilter, ReplicaQuery};
use stager_metadata::{MetadataStore, StagingCoordinator};

/// Build a request from `(se, [lfn, ...])` pairs.
pub fn files(entries: &[(&str, &[&str])]) -> FilesBySe {
    entries
        .iter()
        .map(|(se, lfns)| (se.to_string(), lfns.iter().map(|l| l.to_string()).collect()))
        .collect()
}

/// Submit a request from the conventional test source.
pub async fn submit(
    coordinator: &StagingCoordinator,
    entries: &[(&str, &[&str])],
    source_task_id: &str,
) -> TaskId {
    coordinator
        .set_request(&files(entries), "System", "cb", source_task_id)
        .await
        .expect("set_request failed")
}

/// Fetch one replica by id.
pub async fn replica(store: &dyn MetadataStore, replica_id: ReplicaId) -> Option<CacheReplicaRow> {
    let query = ReplicaQuery::new(ReplicaFilter {
        replica_ids: Some(vec![replica_id]),
        ..ReplicaFilter::default()
    });
    store
        .get_cache_replicas(&query)
        .await
        .expect("get_cache_replicas failed")
        .into_iter()
        .next()
}

/// Fetch every replica, ordered by id.
pub async fn all_replicas(store: &dyn MetadataStore) -> Vec<CacheReplicaRow> {
    store
        .get_cache_replicas(&ReplicaQuery::default())
        .await
        .expect("get_cache_replicas failed")
}

/// Ids of the replicas linked to a task.
pub async fn task_replica_ids(store: &dyn MetadataStore, task_id: TaskId) -> Vec<ReplicaId> {
    store
        .replica_ids_for_tasks(&[task_id])
        .await
        .expect("replica_ids_for_tasks failed")
        .into_iter()
        .collect()
}
