//! PostgreSQL backend tests. Each test starts its own container and is
//! skipped when Docker is unavailable.

mod common;

use common::{all_replicas, files, postgres_or_skip, replica, submit, task_replica_ids};
use stager_core::{ReplicaStatus, StageStatus, TaskStatus};
use stager_metadata::MetadataError;
use stager_metadata::repos::{LinkCheckMode, ReplicaFilter, ReplicaQuery, ReplicaResolution};
use std::collections::BTreeMap;
use time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_postgres_shared_replica_lifecycle() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    let t1 = submit(&coordinator, &[("SE1", &["/a/b"])], "src1").await;
    let t2 = submit(&coordinator, &[("SE1", &["/a/b"])], "src2").await;
    let r1 = task_replica_ids(store.as_ref(), t1).await[0];
    assert_eq!(task_replica_ids(store.as_ref(), t2).await, vec![r1]);
    assert_eq!(replica(store.as_ref(), r1).await.unwrap().links, 2);

    coordinator
        .update_replica_information(&[ReplicaResolution::new(r1, "pfn1", 1000)])
        .await
        .unwrap();
    let waiting = coordinator.get_waiting_replicas().await.unwrap();
    assert_eq!(waiting[&r1].pfn, "pfn1");
    assert_eq!(waiting[&r1].size, 1000);

    coordinator.remove_tasks(&[t1]).await.unwrap();
    assert!(coordinator.remove_unlinked_replicas().await.unwrap().is_empty());
    coordinator.remove_tasks(&[t2]).await.unwrap();
    assert_eq!(coordinator.remove_unlinked_replicas().await.unwrap(), vec![r1]);
    assert!(all_replicas(store.as_ref()).await.is_empty());
    assert!(matches!(
        store.get_task_info(t1).await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_concurrent_submissions_share_one_replica() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let coordinator = metadata.coordinator();

    let mut submissions = JoinSet::new();
    for n in 0..8 {
        let coordinator = coordinator.clone();
        submissions.spawn(async move {
            coordinator
                .set_request(
                    &files(&[("SE1", &["/hot/file", "/hot/other"])]),
                    "System",
                    "cb",
                    &format!("concurrent-{n}"),
                )
                .await
        });
    }
    while let Some(result) = submissions.join_next().await {
        result.unwrap().unwrap();
    }

    let store = metadata.store();
    let replicas = all_replicas(store.as_ref()).await;
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|r| r.links == 8));

    let report = store.verify_link_counts(LinkCheckMode::DryRun).await.unwrap();
    assert!(report.discrepancies.is_empty());
}

#[tokio::test]
async fn test_postgres_task_filter_and_link_repair() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    let t1 = submit(&coordinator, &[("SE1", &["/a", "/b"])], "t1").await;
    submit(&coordinator, &[("SE2", &["/c"])], "t2").await;

    let rows = coordinator
        .get_cache_replicas(&ReplicaQuery::new(ReplicaFilter::for_tasks(vec![t1])))
        .await
        .unwrap();
    let lfns: Vec<&str> = rows.iter().map(|r| r.lfn.as_str()).collect();
    assert_eq!(lfns, vec!["/a", "/b"]);

    let a = rows[0].replica_id;
    sqlx::query("UPDATE cache_replicas SET links = 5 WHERE replica_id = $1")
        .bind(a)
        .execute(metadata.pool())
        .await
        .unwrap();
    let report = coordinator
        .verify_link_counts(LinkCheckMode::Correct)
        .await
        .unwrap();
    assert_eq!(report.corrected, 1);
    assert_eq!(report.discrepancies[0].stored_links, 5);
    assert_eq!(replica(store.as_ref(), a).await.unwrap().links, 1);
}

#[tokio::test]
async fn test_postgres_stage_flow() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    let task = submit(&coordinator, &[("SE1", &["/a", "/b"])], "flow").await;
    let ids = task_replica_ids(store.as_ref(), task).await;
    let (a, b) = (ids[0], ids[1]);
    coordinator
        .update_replica_information(&[
            ReplicaResolution::new(a, "pa", 100),
            ReplicaResolution::new(b, "pb", 200),
        ])
        .await
        .unwrap();

    let requests = BTreeMap::from([("req-1".to_string(), vec![a, b])]);
    assert_eq!(coordinator.insert_stage_request(&requests, None).await.unwrap(), 2);
    let pins = coordinator.get_submitted_stage_pins().await.unwrap();
    assert_eq!(pins["SE1"].replicas, 2);
    assert_eq!(pins["SE1"].total_size, 300);

    coordinator.set_tasks_stage_completing(&[task]).await.unwrap();
    coordinator.set_stage_complete(&[a]).await.unwrap();
    assert!(coordinator.update_stage_completing_tasks().await.unwrap().is_empty());

    let rows = store.get_stage_requests(&[a]).await.unwrap();
    assert_eq!(rows[0].status().unwrap(), StageStatus::Staged);
    assert_eq!(
        rows[0].pin_expiry_time.unwrap(),
        rows[0].stage_request_completed_time.unwrap() + Duration::seconds(84_000)
    );

    coordinator.set_stage_complete(&[b]).await.unwrap();
    assert_eq!(
        coordinator.update_stage_completing_tasks().await.unwrap(),
        vec![task]
    );
    assert_eq!(coordinator.get_staged_replicas().await.unwrap().len(), 2);
    assert_eq!(
        replica(store.as_ref(), b).await.unwrap().replica_status().unwrap(),
        ReplicaStatus::Staged
    );

    assert_eq!(coordinator.set_tasks_done(&[task]).await.unwrap(), 1);
    assert_eq!(coordinator.get_task_status(task).await.unwrap(), TaskStatus::Done);

    coordinator.remove_tasks(&[task]).await.unwrap();
    let removed = coordinator.remove_unlinked_replicas().await.unwrap();
    assert_eq!(removed, vec![a, b]);
    assert!(store.get_stage_requests(&[a, b]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_postgres_stage_request_only_records_waiting_replicas() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let coordinator = metadata.coordinator();
    let store = metadata.store();

    submit(&coordinator, &[("SE1", &["/new", "/resolved"])], "early").await;
    let rows = all_replicas(store.as_ref()).await;
    let id_of = |lfn: &str| rows.iter().find(|r| r.lfn == lfn).unwrap().replica_id;
    let (fresh, resolved) = (id_of("/new"), id_of("/resolved"));
    coordinator
        .update_replica_information(&[ReplicaResolution::new(resolved, "pr", 10)])
        .await
        .unwrap();

    let err = coordinator
        .insert_stage_request(
            &BTreeMap::from([("req-0".to_string(), vec![resolved, 9_999])]),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)), "unexpected error: {err:?}");
    assert!(store.get_stage_requests(&[resolved]).await.unwrap().is_empty());

    let requests = BTreeMap::from([("req-1".to_string(), vec![fresh, resolved])]);
    assert_eq!(coordinator.insert_stage_request(&requests, None).await.unwrap(), 1);
    assert!(store.get_stage_requests(&[fresh]).await.unwrap().is_empty());
    assert_eq!(
        replica(store.as_ref(), fresh).await.unwrap().replica_status().unwrap(),
        ReplicaStatus::New
    );
    assert_eq!(
        replica(store.as_ref(), resolved).await.unwrap().replica_status().unwrap(),
        ReplicaStatus::StageSubmitted
    );
}
