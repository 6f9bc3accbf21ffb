//! Replica cache tests against SQLite.

mod common;

use common::{TestMetadata, all_replicas, replica, submit};
use stager_core::{ReplicaOrigin, ReplicaStatus};
use stager_metadata::MetadataError;
use stager_metadata::repos::{
    LinkCheckMode, ReplicaFilter, ReplicaOrderBy, ReplicaQuery, ReplicaResolution,
    ReplicaTimestamp,
};
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

fn lfns(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_resolve_or_create_creates_then_reuses() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let first = store
        .resolve_or_create("SE1", &lfns(&["/a", "/b", "/a"]), "Stage")
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.values().all(|r| r.origin == ReplicaOrigin::New));

    let second = store
        .resolve_or_create("SE1", &lfns(&["/a", "/c"]), "Stage")
        .await
        .unwrap();
    assert_eq!(second["/a"].origin, ReplicaOrigin::Existing);
    assert_eq!(second["/a"].replica_id, first["/a"].replica_id);
    assert_eq!(second["/c"].origin, ReplicaOrigin::New);

    let row = replica(store.as_ref(), first["/a"].replica_id).await.unwrap();
    assert_eq!(row.replica_status().unwrap(), ReplicaStatus::New);
    assert_eq!(row.replica_type, "Stage");
    assert_eq!(row.pfn, "");
    assert_eq!(row.size, 0);
    assert_eq!(row.links, 0);
    assert_eq!(all_replicas(store.as_ref()).await.len(), 3);
}

#[tokio::test]
async fn test_resolve_or_create_keys_on_storage_element() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let at_se1 = store
        .resolve_or_create("SE1", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    let at_se2 = store
        .resolve_or_create("SE2", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    assert_ne!(at_se1["/a"].replica_id, at_se2["/a"].replica_id);
    assert_eq!(at_se2["/a"].origin, ReplicaOrigin::New);

    let empty = store.resolve_or_create("SE1", &[], "Stage").await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_update_replica_information_moves_new_to_waiting() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    let id = resolved["/a"].replica_id;

    let updated = store
        .update_replica_information(&[ReplicaResolution::new(id, "pfn1", 1000)])
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let row = replica(store.as_ref(), id).await.unwrap();
    assert_eq!(row.replica_status().unwrap(), ReplicaStatus::Waiting);
    assert_eq!(row.pfn, "pfn1");
    assert_eq!(row.size, 1000);

    // A late re-resolution before submission refreshes the location.
    store
        .update_replica_information(&[ReplicaResolution::new(id, "pfn2", 2000)])
        .await
        .unwrap();
    let row = replica(store.as_ref(), id).await.unwrap();
    assert_eq!(row.pfn, "pfn2");
    assert_eq!(row.size, 2000);
}

#[tokio::test]
async fn test_cancelled_replica_ignores_resolution() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    let id = resolved["/a"].replica_id;

    let cancelled = store
        .update_replica_status(&[id], ReplicaStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled, vec![id]);

    let updated = store
        .update_replica_information(&[ReplicaResolution::new(id, "pfn1", 1000)])
        .await
        .unwrap();
    assert_eq!(updated, 0);

    let row = replica(store.as_ref(), id).await.unwrap();
    assert_eq!(row.replica_status().unwrap(), ReplicaStatus::Cancelled);
    assert_eq!(row.pfn, "");
    assert_eq!(row.size, 0);
}

#[tokio::test]
async fn test_update_replica_failure_overrides_any_status() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a", "/b"]), "Stage")
        .await
        .unwrap();
    let (a, b) = (resolved["/a"].replica_id, resolved["/b"].replica_id);

    store.update_replica_status(&[b], ReplicaStatus::Cancelled).await.unwrap();

    let failures = BTreeMap::from([
        (a, "no such file".to_string()),
        (b, "backend offline".to_string()),
    ]);
    assert_eq!(store.update_replica_failure(&failures).await.unwrap(), 2);

    for (id, reason) in &failures {
        let row = replica(store.as_ref(), *id).await.unwrap();
        assert_eq!(row.replica_status().unwrap(), ReplicaStatus::Failed);
        assert_eq!(row.reason.as_deref(), Some(reason.as_str()));
    }
    assert_eq!(store.update_replica_failure(&BTreeMap::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_update_replica_status_follows_state_machine() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    let id = resolved["/a"].replica_id;

    // New cannot be staged directly.
    let moved = store
        .update_replica_status(&[id], ReplicaStatus::Staged)
        .await
        .unwrap();
    assert!(moved.is_empty());
    let row = replica(store.as_ref(), id).await.unwrap();
    assert_eq!(row.replica_status().unwrap(), ReplicaStatus::New);

    // Nothing leads back to New.
    let err = store
        .update_replica_status(&[id], ReplicaStatus::New)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

    // Terminal replicas stay terminal.
    store.update_replica_status(&[id], ReplicaStatus::Failed).await.unwrap();
    let moved = store
        .update_replica_status(&[id], ReplicaStatus::Cancelled)
        .await
        .unwrap();
    assert!(moved.is_empty());
}

#[tokio::test]
async fn test_get_cache_replicas_filters_by_task_through_links() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    let t1 = submit(&coordinator, &[("SE1", &["/a", "/b"])], "t1").await;
    let t2 = submit(&coordinator, &[("SE1", &["/b", "/c"]), ("SE2", &["/d"])], "t2").await;

    let by_t1 = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::for_tasks(vec![t1])))
        .await
        .unwrap();
    let lfns_t1: Vec<&str> = by_t1.iter().map(|r| r.lfn.as_str()).collect();
    assert_eq!(lfns_t1, vec!["/a", "/b"]);

    let by_both = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::for_tasks(vec![t1, t2])))
        .await
        .unwrap();
    assert_eq!(by_both.len(), 4);

    // Task filter combines with ordinary attribute filters.
    let t2_at_se1 = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter {
            task_ids: Some(vec![t2]),
            se: Some("SE1".to_string()),
            ..ReplicaFilter::default()
        }))
        .await
        .unwrap();
    let lfns_t2: Vec<&str> = t2_at_se1.iter().map(|r| r.lfn.as_str()).collect();
    assert_eq!(lfns_t2, vec!["/b", "/c"]);

    // Replica id and task filters intersect.
    let a_id = by_t1[0].replica_id;
    let none = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter {
            task_ids: Some(vec![t2]),
            replica_ids: Some(vec![a_id]),
            ..ReplicaFilter::default()
        }))
        .await
        .unwrap();
    assert!(none.is_empty());

    // A task without links matches nothing rather than everything.
    let unknown = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::for_tasks(vec![9_999])))
        .await
        .unwrap();
    assert!(unknown.is_empty());
}

#[tokio::test]
async fn test_get_cache_replicas_handles_lists_longer_than_a_batch() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let names: Vec<String> = (0..1_500).map(|n| format!("/bulk/{n:04}")).collect();
    let resolved = store
        .resolve_or_create("SE1", &names, "Stage")
        .await
        .unwrap();
    let mut ids: Vec<i64> = resolved.values().map(|r| r.replica_id).collect();
    ids.sort_unstable();
    assert_eq!(ids.len(), 1_500);

    // Unknown ids and lfns pad both lists without matching anything.
    let padded_ids: Vec<i64> = ids.iter().copied().chain(1_000_000..1_000_500).collect();
    let padded_lfns: Vec<String> = names
        .iter()
        .cloned()
        .chain((0..500).map(|n| format!("/missing/{n}")))
        .collect();
    let rows = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter {
            replica_ids: Some(padded_ids),
            lfns: Some(padded_lfns),
            ..ReplicaFilter::default()
        }))
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.replica_id).collect::<Vec<_>>(), ids);

    // A task filter resolving to many replicas goes through the same path.
    let task = store.create_task("System", "cb", "bulk").await.unwrap();
    assert_eq!(store.link(task, &ids).await.unwrap(), 1_500);
    let linked = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::for_tasks(vec![task])))
        .await
        .unwrap();
    assert_eq!(linked.len(), 1_500);
}

#[tokio::test]
async fn test_get_cache_replicas_filters_orders_and_limits() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a", "/b", "/c"]), "Stage")
        .await
        .unwrap();
    store
        .update_replica_information(&[
            ReplicaResolution::new(resolved["/a"].replica_id, "pa", 300),
            ReplicaResolution::new(resolved["/b"].replica_id, "pb", 100),
        ])
        .await
        .unwrap();

    let waiting = store.get_replicas_with_status(ReplicaStatus::Waiting).await.unwrap();
    assert_eq!(waiting.len(), 2);

    let by_size = store
        .get_cache_replicas(&ReplicaQuery {
            order_by: Some(ReplicaOrderBy::Size),
            descending: true,
            limit: Some(2),
            ..ReplicaQuery::default()
        })
        .await
        .unwrap();
    let sizes: Vec<i64> = by_size.iter().map(|r| r.size).collect();
    assert_eq!(sizes, vec![300, 100]);

    let by_lfn = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter {
            lfns: Some(lfns(&["/c", "/zzz"])),
            replica_type: Some("Stage".to_string()),
            ..ReplicaFilter::default()
        }))
        .await
        .unwrap();
    assert_eq!(by_lfn.len(), 1);
    assert_eq!(by_lfn[0].lfn, "/c");

    let empty_list = store
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter {
            statuses: Some(Vec::new()),
            ..ReplicaFilter::default()
        }))
        .await
        .unwrap();
    assert!(empty_list.is_empty());
}

#[tokio::test]
async fn test_get_cache_replicas_time_window() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    store
        .resolve_or_create("SE1", &lfns(&["/a", "/b"]), "Stage")
        .await
        .unwrap();

    let now = OffsetDateTime::now_utc();
    let older_than_future = store
        .get_cache_replicas(&ReplicaQuery {
            older_than: Some(now + Duration::hours(1)),
            timestamp: ReplicaTimestamp::SubmitTime,
            ..ReplicaQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(older_than_future.len(), 2);

    let newer_than_future = store
        .get_cache_replicas(&ReplicaQuery {
            newer_than: Some(now + Duration::hours(1)),
            ..ReplicaQuery::default()
        })
        .await
        .unwrap();
    assert!(newer_than_future.is_empty());

    let newer_than_past = store
        .get_cache_replicas(&ReplicaQuery {
            newer_than: Some(now - Duration::hours(1)),
            ..ReplicaQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(newer_than_past.len(), 2);
}

#[tokio::test]
async fn test_submitted_stage_pins_count_replicas_past_waiting() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let se1 = store
        .resolve_or_create("SE1", &lfns(&["/a", "/b", "/c", "/d"]), "Stage")
        .await
        .unwrap();
    let se2 = store
        .resolve_or_create("SE2", &lfns(&["/e"]), "Stage")
        .await
        .unwrap();
    let (a, b, c) = (se1["/a"].replica_id, se1["/b"].replica_id, se1["/c"].replica_id);
    let e = se2["/e"].replica_id;

    store
        .update_replica_information(&[
            ReplicaResolution::new(a, "pa", 100),
            ReplicaResolution::new(b, "pb", 200),
            ReplicaResolution::new(c, "pc", 400),
            ReplicaResolution::new(e, "pe", 800),
        ])
        .await
        .unwrap();
    let requests = BTreeMap::from([("req-1".to_string(), vec![a, b, e])]);
    store.insert_stage_request(&requests, 3600).await.unwrap();
    // "/c" stays Waiting and "/d" stays New: neither holds a pin.

    let pins = store.get_submitted_stage_pins().await.unwrap();
    assert_eq!(pins.len(), 2);
    assert_eq!(pins["SE1"].replicas, 2);
    assert_eq!(pins["SE1"].total_size, 300);
    assert_eq!(pins["SE2"].replicas, 1);
    assert_eq!(pins["SE2"].total_size, 800);

    store
        .update_replica_failure(&BTreeMap::from([(e, "lost".to_string())]))
        .await
        .unwrap();
    let pins = store.get_submitted_stage_pins().await.unwrap();
    assert!(!pins.contains_key("SE2"));
}

#[tokio::test]
async fn test_verify_link_counts_reports_and_corrects_drift() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    let t1 = submit(&coordinator, &[("SE1", &["/a", "/b"])], "t1").await;
    submit(&coordinator, &[("SE1", &["/a"])], "t2").await;

    let clean = store.verify_link_counts(LinkCheckMode::DryRun).await.unwrap();
    assert_eq!(clean.replicas_verified, 2);
    assert!(clean.discrepancies.is_empty());

    let a = common::task_replica_ids(store.as_ref(), t1).await[0];
    sqlx::query("UPDATE cache_replicas SET links = 7 WHERE replica_id = ?")
        .bind(a)
        .execute(metadata.pool())
        .await
        .unwrap();

    let report = store.verify_link_counts(LinkCheckMode::DryRun).await.unwrap();
    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.discrepancies[0].replica_id, a);
    assert_eq!(report.discrepancies[0].stored_links, 7);
    assert_eq!(report.discrepancies[0].computed_links, 2);
    assert_eq!(report.corrected, 0);
    assert_eq!(replica(store.as_ref(), a).await.unwrap().links, 7);

    let fixed = store.verify_link_counts(LinkCheckMode::Correct).await.unwrap();
    assert_eq!(fixed.corrected, 1);
    assert_eq!(replica(store.as_ref(), a).await.unwrap().links, 2);
    assert!(
        store
            .verify_link_counts(LinkCheckMode::DryRun)
            .await
            .unwrap()
            .discrepancies
            .is_empty()
    );
}

#[tokio::test]
async fn test_remove_unlinked_replicas_empty_is_noop() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    assert!(store.remove_unlinked_replicas().await.unwrap().is_empty());

    let task = store.create_task("System", "cb", "t").await.unwrap();
    let resolved = store
        .resolve_or_create("SE1", &lfns(&["/a"]), "Stage")
        .await
        .unwrap();
    store.link(task, &[resolved["/a"].replica_id]).await.unwrap();
    assert!(store.remove_unlinked_replicas().await.unwrap().is_empty());
    assert_eq!(all_replicas(store.as_ref()).await.len(), 1);
}
