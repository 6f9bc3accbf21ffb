//! Task registry repository.

use crate::error::MetadataResult;
use crate::models::{TaskRow, TaskSummary};
use async_trait::async_trait;
use stager_core::{ReplicaId, TaskCallback, TaskId, TaskStatus};
use std::collections::BTreeMap;

/// Repository for task operations.
#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Create a task in `Submitted` status and return its generated id.
    ///
    /// The id comes from the database's own key generation, so concurrent
    /// callers never race on it.
    async fn create_task(
        &self,
        source: &str,
        callback_method: &str,
        source_task_id: &str,
    ) -> MetadataResult<TaskId>;

    /// Get callback details of every task in the given status.
    async fn get_tasks_with_status(
        &self,
        status: TaskStatus,
    ) -> MetadataResult<BTreeMap<TaskId, TaskCallback>>;

    /// Get a task. Fails with `NotFound` if it does not exist.
    async fn get_task_info(&self, task_id: TaskId) -> MetadataResult<TaskRow>;

    /// Get a task's status. Fails with `NotFound` if it does not exist.
    async fn get_task_status(&self, task_id: TaskId) -> MetadataResult<TaskStatus> {
        let task = self.get_task_info(task_id).await?;
        Ok(task.task_status()?)
    }

    /// Get a task together with every replica linked to it.
    async fn get_task_summary(&self, task_id: TaskId) -> MetadataResult<TaskSummary>;

    /// Move tasks forward to `to`.
    ///
    /// Only tasks whose current status precedes `to` move; the rest are left
    /// untouched. Moving to `Done` also stamps the completion time.
    /// Returns the ids that moved.
    async fn update_task_status(
        &self,
        task_ids: &[TaskId],
        to: TaskStatus,
    ) -> MetadataResult<Vec<TaskId>>;

    /// For every `StageCompleting` task, count the linked replicas whose
    /// status is not `Staged`. Tasks without links report zero.
    async fn get_stage_completing_progress(&self) -> MetadataResult<BTreeMap<TaskId, u64>>;

    /// Mark tasks `Done` and stamp their completion time.
    ///
    /// Returns the number of tasks updated. An empty list is a no-op.
    async fn set_tasks_done(&self, task_ids: &[TaskId]) -> MetadataResult<u64>;

    /// Delete tasks together with their links.
    ///
    /// Links are removed first, in the same transaction, which is what
    /// releases the tasks' references on their replicas. Returns the number
    /// of tasks deleted. An empty list is a no-op.
    async fn remove_tasks(&self, task_ids: &[TaskId]) -> MetadataResult<u64>;

    /// Undo a partially populated task.
    ///
    /// Deletes the task's links and the task itself, then deletes those of
    /// `created_replicas` that no other task has linked in the meantime.
    /// Everything happens in one transaction.
    async fn discard_task(
        &self,
        task_id: TaskId,
        created_replicas: &[ReplicaId],
    ) -> MetadataResult<()>;
}
