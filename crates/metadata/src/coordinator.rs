//! Staging coordinator.
//!
//! Composes the task registry, replica cache, linker and stage request
//! tracker into the operations an external scheduler drives: task
//! submission, the per-phase reads and transitions of the polling loop,
//! finalisation and garbage collection.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{
    CacheReplicaRow, RequestedReplica, StagePinUsage, TaskRow, TaskSummary, WaitingReplica,
};
use crate::repos::{LinkCheckMode, LinkCheckReport, ReplicaQuery, ReplicaResolution};
use crate::store::MetadataStore;
use stager_core::config::StagingConfig;
use stager_core::{ReplicaId, ReplicaOrigin, ReplicaStatus, TaskCallback, TaskId, TaskStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Files to stage, keyed by storage element.
pub type FilesBySe = BTreeMap<String, Vec<String>>;

/// Orchestrates the staging pipeline over a shared metadata store.
#[derive(Clone)]
pub struct StagingCoordinator {
    store: Arc<dyn MetadataStore>,
    config: StagingConfig,
}

impl StagingCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, config: StagingConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a staging task.
    ///
    /// Creates the task, resolves every requested file to a cache replica
    /// (reusing replicas already cached at the same storage element) and
    /// links them all to the task. Either everything is written or nothing
    /// is: on failure the task and the replicas this call created are
    /// discarded. If discarding fails too, `PartialWrite` names the task.
    pub async fn set_request(
        &self,
        files: &FilesBySe,
        source: &str,
        callback_method: &str,
        source_task_id: &str,
    ) -> MetadataResult<TaskId> {
        validate_request(files)?;

        let task_id = self
            .store
            .create_task(source, callback_method, source_task_id)
            .await?;

        let mut created = Vec::new();
        match self.populate(task_id, files, &mut created).await {
            Ok(linked) => {
                tracing::info!(
                    task_id,
                    source,
                    source_task_id,
                    replicas = linked,
                    created = created.len(),
                    "task submitted"
                );
                Ok(task_id)
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "task submission failed, discarding task");
                match self.store.discard_task(task_id, &created).await {
                    Ok(()) => Err(err),
                    Err(compensation) => {
                        tracing::error!(
                            task_id,
                            error = %err,
                            compensation_error = %compensation,
                            "could not discard partially submitted task"
                        );
                        Err(MetadataError::PartialWrite {
                            operation: "set_request",
                            task_id,
                            detail: format!("{err}; discarding the task failed: {compensation}"),
                        })
                    }
                }
            }
        }
    }

    /// Resolve and link. A replica collected by garbage collection between
    /// resolution and linking surfaces as a conflict; resolution then runs
    /// once more, which recreates it.
    async fn populate(
        &self,
        task_id: TaskId,
        files: &FilesBySe,
        created: &mut Vec<ReplicaId>,
    ) -> MetadataResult<u64> {
        let replica_ids = self.resolve_all(files, created).await?;
        match self.store.link(task_id, &replica_ids).await {
            Err(err) if err.is_conflict() => {
                tracing::debug!(task_id, error = %err, "replicas vanished before linking, resolving again");
                let replica_ids = self.resolve_all(files, created).await?;
                self.store.link(task_id, &replica_ids).await
            }
            other => other,
        }
    }

    async fn resolve_all(
        &self,
        files: &FilesBySe,
        created: &mut Vec<ReplicaId>,
    ) -> MetadataResult<Vec<ReplicaId>> {
        let mut replica_ids = Vec::new();
        for (se, lfns) in files {
            let resolved = self
                .store
                .resolve_or_create(se, lfns, &self.config.replica_type)
                .await?;
            for replica in resolved.values() {
                if replica.origin == ReplicaOrigin::New {
                    created.push(replica.replica_id);
                }
                replica_ids.push(replica.replica_id);
            }
        }
        Ok(replica_ids)
    }

    // =========================================================================
    // Polling loop phases
    // =========================================================================

    /// `Waiting` replicas of tasks whose replicas are all resolved.
    pub async fn get_waiting_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, WaitingReplica>> {
        self.store.get_waiting_replicas().await
    }

    /// Record resolved locations; cancelled and failed replicas are skipped.
    pub async fn update_replica_information(
        &self,
        entries: &[ReplicaResolution],
    ) -> MetadataResult<u64> {
        self.store.update_replica_information(entries).await
    }

    pub async fn update_replica_failure(
        &self,
        failures: &BTreeMap<ReplicaId, String>,
    ) -> MetadataResult<u64> {
        self.store.update_replica_failure(failures).await
    }

    /// Record stage requests. Without an explicit pin lifetime the
    /// configured default is requested.
    pub async fn insert_stage_request(
        &self,
        requests: &BTreeMap<String, Vec<ReplicaId>>,
        pin_lifetime_secs: Option<u64>,
    ) -> MetadataResult<u64> {
        let pin_lifetime = pin_lifetime_secs.unwrap_or(self.config.default_pin_lifetime_secs);
        self.store.insert_stage_request(requests, pin_lifetime).await
    }

    pub async fn get_stage_submitted_replicas(
        &self,
    ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
        self.store.get_stage_submitted_replicas().await
    }

    /// Complete stage requests, deriving pin expiry from the configured
    /// policy.
    pub async fn set_stage_complete(&self, replica_ids: &[ReplicaId]) -> MetadataResult<u64> {
        self.store
            .set_stage_complete(replica_ids, self.config.pin_expiry)
            .await
    }

    pub async fn get_staged_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
        self.store.get_staged_replicas().await
    }

    /// Move `Staged` replicas to `Pinned`. Returns the ids that moved.
    pub async fn pin_replicas(&self, replica_ids: &[ReplicaId]) -> MetadataResult<Vec<ReplicaId>> {
        self.store
            .update_replica_status(replica_ids, ReplicaStatus::Pinned)
            .await
    }

    /// Cancel replicas out of band. Terminal replicas are left alone.
    pub async fn cancel_replicas(&self, replica_ids: &[ReplicaId]) -> MetadataResult<Vec<ReplicaId>> {
        let cancelled = self
            .store
            .update_replica_status(replica_ids, ReplicaStatus::Cancelled)
            .await?;
        tracing::info!(
            requested = replica_ids.len(),
            cancelled = cancelled.len(),
            "cancelled replicas"
        );
        Ok(cancelled)
    }

    /// Move `Submitted` tasks to `StageCompleting` once they have been
    /// handed to the backends.
    pub async fn set_tasks_stage_completing(
        &self,
        task_ids: &[TaskId],
    ) -> MetadataResult<Vec<TaskId>> {
        self.store
            .update_task_status(task_ids, TaskStatus::StageCompleting)
            .await
    }

    // =========================================================================
    // Finalisation and cleanup
    // =========================================================================

    /// Move every `StageCompleting` task whose linked replicas are all
    /// `Staged` to `Staged`. A task with no linked replicas counts as
    /// complete. Returns the ids that moved.
    ///
    /// A task linked to a replica that is `Pinned`, `Failed` or `Cancelled`
    /// is never moved, since that replica cannot return to `Staged`. This
    /// happens when a task reuses a replica another task already pinned.
    /// Such tasks stay `StageCompleting` until an operator finishes them
    /// with [`set_tasks_done`](Self::set_tasks_done) or removes them.
    pub async fn update_stage_completing_tasks(&self) -> MetadataResult<Vec<TaskId>> {
        let progress = self.store.get_stage_completing_progress().await?;
        let complete: Vec<TaskId> = progress
            .iter()
            .filter(|(_, pending)| **pending == 0)
            .map(|(task_id, _)| *task_id)
            .collect();
        if complete.is_empty() {
            tracing::debug!(tasks = progress.len(), "no stage completing task is complete");
            return Ok(Vec::new());
        }

        let staged = self
            .store
            .update_task_status(&complete, TaskStatus::Staged)
            .await?;
        tracing::info!(
            checked = progress.len(),
            staged = staged.len(),
            "updated stage completing tasks"
        );
        Ok(staged)
    }

    pub async fn set_tasks_done(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
        self.store.set_tasks_done(task_ids).await
    }

    /// Delete tasks and their links, releasing their replicas.
    pub async fn remove_tasks(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
        self.store.remove_tasks(task_ids).await
    }

    /// Delete replicas no task references, with their stage requests.
    pub async fn remove_unlinked_replicas(&self) -> MetadataResult<Vec<ReplicaId>> {
        self.store.remove_unlinked_replicas().await
    }

    pub async fn verify_link_counts(&self, mode: LinkCheckMode) -> MetadataResult<LinkCheckReport> {
        self.store.verify_link_counts(mode).await
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    pub async fn get_tasks_with_status(
        &self,
        status: TaskStatus,
    ) -> MetadataResult<BTreeMap<TaskId, TaskCallback>> {
        self.store.get_tasks_with_status(status).await
    }

    pub async fn get_task_info(&self, task_id: TaskId) -> MetadataResult<TaskRow> {
        self.store.get_task_info(task_id).await
    }

    pub async fn get_task_status(&self, task_id: TaskId) -> MetadataResult<TaskStatus> {
        self.store.get_task_status(task_id).await
    }

    pub async fn get_task_summary(&self, task_id: TaskId) -> MetadataResult<TaskSummary> {
        self.store.get_task_summary(task_id).await
    }

    pub async fn get_cache_replicas(&self, query: &ReplicaQuery) -> MetadataResult<Vec<CacheReplicaRow>> {
        self.store.get_cache_replicas(query).await
    }

    pub async fn get_submitted_stage_pins(&self) -> MetadataResult<BTreeMap<String, StagePinUsage>> {
        self.store.get_submitted_stage_pins().await
    }
}

/// Reject submissions that would create an empty task or a replica without
/// a storage element or LFN.
fn validate_request(files: &FilesBySe) -> MetadataResult<()> {
    if files.values().all(Vec::is_empty) {
        return Err(MetadataError::InvalidInput(
            "request contains no files".to_string(),
        ));
    }
    for (se, lfns) in files {
        if se.trim().is_empty() {
            return Err(MetadataError::InvalidInput(
                "storage element must not be empty".to_string(),
            ));
        }
        if lfns.iter().any(|lfn| lfn.trim().is_empty()) {
            return Err(MetadataError::InvalidInput(format!(
                "empty LFN requested at {se}"
            )));
        }
    }
    Ok(())
}
