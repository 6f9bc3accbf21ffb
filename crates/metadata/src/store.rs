//! Metadata store trait and implementations.

use crate::error::MetadataResult;
use crate::repos::{LinkRepo, ReplicaRepo, StageRequestRepo, TaskRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: TaskRepo + ReplicaRepo + LinkRepo + StageRequestRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store. `:memory:` opens a private in-memory
    /// database that lives as long as the store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";

        let mut opts = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        opts = opts
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite serialises writers anyway, and an in-memory
        // database exists only inside the connection that created it.
        let mut pool_opts = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(
            path = %path.display(),
            query_timeout_secs = query_timeout_secs.unwrap_or(600),
            "opened SQLite metadata store (query timeout is advisory only)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::{MetadataError, classify, format_ids};
    use crate::models::*;
    use crate::repos::{
        LinkCheckMode, LinkCheckReport, LinkDiscrepancy, ReplicaQuery, ReplicaResolution,
    };
    use sqlx::{QueryBuilder, SqliteConnection};
    use stager_core::{
        PinExpiryPolicy, ReplicaId, ReplicaOrigin, ReplicaStatus, StageStatus, TaskCallback,
        TaskId, TaskStatus,
    };
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use time::OffsetDateTime;

    /// SQLite has a limit of ~999 bound parameters per statement.
    const BATCH_SIZE: usize = 900;

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    fn status_list<S: AsRef<str>>(statuses: &[S]) -> String {
        statuses
            .iter()
            .map(|s| format!("'{}'", s.as_ref()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn json_list<T: serde::Serialize>(values: &[T]) -> MetadataResult<String> {
        serde_json::to_string(values).map_err(|e| MetadataError::Internal(e.to_string()))
    }

    fn count(value: i64) -> u64 {
        u64::try_from(value).unwrap_or(0)
    }

    /// Recompute `links` of the given replicas from the link table.
    async fn refresh_links(
        conn: &mut SqliteConnection,
        replica_ids: &[ReplicaId],
    ) -> MetadataResult<()> {
        for batch in replica_ids.chunks(BATCH_SIZE) {
            let sql = format!(
                "UPDATE cache_replicas SET links = \
                 (SELECT COUNT(*) FROM task_replicas tr WHERE tr.replica_id = cache_replicas.replica_id) \
                 WHERE replica_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query.execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn linked_replicas(
        conn: &mut SqliteConnection,
        task_ids: &[TaskId],
    ) -> MetadataResult<BTreeSet<ReplicaId>> {
        let mut result = BTreeSet::new();
        for batch in task_ids.chunks(BATCH_SIZE) {
            let sql = format!(
                "SELECT DISTINCT replica_id FROM task_replicas WHERE task_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in batch {
                query = query.bind(id);
            }
            result.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(result)
    }

    /// Delete the links of the given tasks and release their replicas.
    async fn unlink_in(conn: &mut SqliteConnection, task_ids: &[TaskId]) -> MetadataResult<u64> {
        let affected: Vec<ReplicaId> = linked_replicas(conn, task_ids).await?.into_iter().collect();

        let mut removed = 0;
        for batch in task_ids.chunks(BATCH_SIZE) {
            let sql = format!(
                "DELETE FROM task_replicas WHERE task_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            removed += query.execute(&mut *conn).await?.rows_affected();
        }

        refresh_links(conn, &affected).await?;
        Ok(removed)
    }

    async fn delete_tasks_in(conn: &mut SqliteConnection, task_ids: &[TaskId]) -> MetadataResult<u64> {
        let mut removed = 0;
        for batch in task_ids.chunks(BATCH_SIZE) {
            let sql = format!(
                "DELETE FROM tasks WHERE task_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            removed += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(removed)
    }

    /// Delete replicas that are unreferenced, along with their stage requests.
    ///
    /// The reference check is repeated in the predicate so a replica linked
    /// after the candidates were chosen survives.
    async fn delete_unlinked_in(
        conn: &mut SqliteConnection,
        candidates: &[ReplicaId],
    ) -> MetadataResult<Vec<ReplicaId>> {
        let mut deleted = Vec::new();
        for batch in candidates.chunks(BATCH_SIZE) {
            let list = placeholders(batch.len());
            let sql = format!(
                "DELETE FROM stage_requests WHERE replica_id IN ({list}) \
                 AND NOT EXISTS (SELECT 1 FROM task_replicas tr WHERE tr.replica_id = stage_requests.replica_id)"
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query.execute(&mut *conn).await?;

            let sql = format!(
                "DELETE FROM cache_replicas WHERE replica_id IN ({list}) AND links = 0 \
                 AND NOT EXISTS (SELECT 1 FROM task_replicas tr WHERE tr.replica_id = cache_replicas.replica_id) \
                 RETURNING replica_id"
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in batch {
                query = query.bind(id);
            }
            deleted.extend(query.fetch_all(&mut *conn).await?);
        }
        deleted.sort_unstable();
        Ok(deleted)
    }

    #[async_trait]
    impl TaskRepo for SqliteStore {
        async fn create_task(
            &self,
            source: &str,
            callback_method: &str,
            source_task_id: &str,
        ) -> MetadataResult<TaskId> {
            let task_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO tasks (source, callback_method, source_task_id, status, submit_time)
                VALUES (?, ?, ?, ?, ?)
                RETURNING task_id
                "#,
            )
            .bind(source)
            .bind(callback_method)
            .bind(source_task_id)
            .bind(TaskStatus::Submitted.as_str())
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&self.pool)
            .await?;

            tracing::info!(task_id, source, source_task_id, "created task");
            Ok(task_id)
        }

        async fn get_tasks_with_status(
            &self,
            status: TaskStatus,
        ) -> MetadataResult<BTreeMap<TaskId, TaskCallback>> {
            let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
                "SELECT task_id, source, callback_method, source_task_id FROM tasks WHERE status = ?",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(task_id, source, callback_method, source_task_id)| {
                    (
                        task_id,
                        TaskCallback {
                            source,
                            callback_method,
                            source_task_id,
                        },
                    )
                })
                .collect())
        }

        async fn get_task_info(&self, task_id: TaskId) -> MetadataResult<TaskRow> {
            sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("task {task_id}")))
        }

        async fn get_task_summary(&self, task_id: TaskId) -> MetadataResult<TaskSummary> {
            let task = self.get_task_info(task_id).await?;
            let replicas = sqlx::query_as::<_, TaskReplicaSummary>(
                r#"
                SELECT r.replica_id, r.lfn, r.se, r.pfn, r.size, r.status, r.reason
                FROM task_replicas tr
                JOIN cache_replicas r ON r.replica_id = tr.replica_id
                WHERE tr.task_id = ?
                ORDER BY r.replica_id
                "#,
            )
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;

            Ok(TaskSummary { task, replicas })
        }

        async fn update_task_status(
            &self,
            task_ids: &[TaskId],
            to: TaskStatus,
        ) -> MetadataResult<Vec<TaskId>> {
            let from = TaskStatus::predecessors(to);
            if from.is_empty() {
                return Err(MetadataError::InvalidStateTransition {
                    from: "any".to_string(),
                    to: to.to_string(),
                });
            }
            if task_ids.is_empty() {
                return Ok(Vec::new());
            }

            let from: Vec<&str> = from.iter().map(TaskStatus::as_str).collect();
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut moved = Vec::new();
            for batch in task_ids.chunks(BATCH_SIZE) {
                let sql = format!(
                    "UPDATE tasks SET status = ?, \
                     complete_time = CASE WHEN ? THEN COALESCE(complete_time, ?) ELSE complete_time END \
                     WHERE task_id IN ({}) AND status IN ({}) RETURNING task_id",
                    placeholders(batch.len()),
                    status_list(&from)
                );
                let mut query = sqlx::query_scalar::<_, i64>(&sql)
                    .bind(to.as_str())
                    .bind(to == TaskStatus::Done)
                    .bind(now);
                for id in batch {
                    query = query.bind(id);
                }
                moved.extend(query.fetch_all(&mut *tx).await?);
            }
            tx.commit().await?;

            moved.sort_unstable();
            if moved.len() < task_ids.len() {
                tracing::debug!(
                    to = %to,
                    requested = task_ids.len(),
                    moved = moved.len(),
                    "some tasks were not in a status preceding the target"
                );
            }
            Ok(moved)
        }

        async fn get_stage_completing_progress(&self) -> MetadataResult<BTreeMap<TaskId, u64>> {
            let rows: Vec<(i64, i64)> = sqlx::query_as(
                r#"
                SELECT t.task_id,
                       COALESCE(SUM(CASE WHEN r.status <> 'Staged' THEN 1 ELSE 0 END), 0)
                FROM tasks t
                LEFT JOIN task_replicas tr ON tr.task_id = t.task_id
                LEFT JOIN cache_replicas r ON r.replica_id = tr.replica_id
                WHERE t.status = 'StageCompleting'
                GROUP BY t.task_id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(task_id, pending)| (task_id, count(pending)))
                .collect())
        }

        async fn set_tasks_done(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
            if task_ids.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;
            for batch in task_ids.chunks(BATCH_SIZE) {
                let sql = format!(
                    "UPDATE tasks SET status = 'Done', complete_time = ? WHERE task_id IN ({})",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query(&sql).bind(now);
                for id in batch {
                    query = query.bind(id);
                }
                updated += query.execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;

            tracing::info!(tasks = updated, "marked tasks done");
            Ok(updated)
        }

        async fn remove_tasks(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
            if task_ids.is_empty() {
                return Ok(0);
            }

            let mut tx = self.pool.begin().await?;
            let links = unlink_in(&mut tx, task_ids).await?;
            let removed = delete_tasks_in(&mut tx, task_ids).await?;
            tx.commit().await?;

            tracing::info!(tasks = removed, links, "removed tasks");
            Ok(removed)
        }

        async fn discard_task(
            &self,
            task_id: TaskId,
            created_replicas: &[ReplicaId],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            unlink_in(&mut tx, &[task_id]).await?;
            delete_tasks_in(&mut tx, &[task_id]).await?;
            let dropped = delete_unlinked_in(&mut tx, created_replicas).await?;
            tx.commit().await?;

            tracing::warn!(
                task_id,
                replicas_dropped = dropped.len(),
                "discarded partially populated task"
            );
            Ok(())
        }
    }

    #[async_trait]
    impl LinkRepo for SqliteStore {
        async fn link(&self, task_id: TaskId, replica_ids: &[ReplicaId]) -> MetadataResult<u64> {
            let wanted: Vec<ReplicaId> = replica_ids
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if wanted.is_empty() {
                return Ok(0);
            }

            let mut tx = self.pool.begin().await?;

            let mut present = BTreeSet::new();
            for batch in wanted.chunks(BATCH_SIZE) {
                let sql = format!(
                    "SELECT replica_id FROM cache_replicas WHERE replica_id IN ({})",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_scalar::<_, i64>(&sql);
                for id in batch {
                    query = query.bind(id);
                }
                present.extend(query.fetch_all(&mut *tx).await?);
            }
            let missing: Vec<ReplicaId> = wanted
                .iter()
                .copied()
                .filter(|id| !present.contains(id))
                .collect();
            if !missing.is_empty() {
                return Err(MetadataError::MissingReplicas {
                    replica_ids: missing,
                });
            }

            let mut inserted = 0;
            for batch in wanted.chunks(BATCH_SIZE / 2) {
                let mut builder =
                    QueryBuilder::<Sqlite>::new("INSERT INTO task_replicas (task_id, replica_id) ");
                builder.push_values(batch, |mut row, replica_id| {
                    row.push_bind(task_id).push_bind(*replica_id);
                });
                builder.push(" ON CONFLICT (task_id, replica_id) DO NOTHING");
                inserted += builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify("link", e))?
                    .rows_affected();
            }

            refresh_links(&mut tx, &wanted).await?;
            tx.commit().await?;

            tracing::info!(task_id, replicas = wanted.len(), inserted, "linked replicas to task");
            Ok(inserted)
        }

        async fn replica_ids_for_tasks(
            &self,
            task_ids: &[TaskId],
        ) -> MetadataResult<BTreeSet<ReplicaId>> {
            let mut conn = self.pool.acquire().await?;
            linked_replicas(&mut conn, task_ids).await
        }

        async fn unlink(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
            if task_ids.is_empty() {
                return Ok(0);
            }

            let mut tx = self.pool.begin().await?;
            let removed = unlink_in(&mut tx, task_ids).await?;
            tx.commit().await?;

            tracing::info!(tasks = task_ids.len(), links = removed, "unlinked tasks");
            Ok(removed)
        }
    }

    #[async_trait]
    impl ReplicaRepo for SqliteStore {
        async fn resolve_or_create(
            &self,
            se: &str,
            lfns: &[String],
            replica_type: &str,
        ) -> MetadataResult<HashMap<String, ResolvedReplica>> {
            let wanted: BTreeSet<&str> = lfns.iter().map(String::as_str).collect();
            let mut result = HashMap::with_capacity(wanted.len());
            if wanted.is_empty() {
                return Ok(result);
            }

            let wanted: Vec<&str> = wanted.into_iter().collect();
            let mut tx = self.pool.begin().await?;

            for batch in wanted.chunks(BATCH_SIZE) {
                let sql = format!(
                    "SELECT replica_id, lfn FROM cache_replicas WHERE se = ? AND lfn IN ({})",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_as::<_, (i64, String)>(&sql).bind(se);
                for lfn in batch {
                    query = query.bind(*lfn);
                }
                for (replica_id, lfn) in query.fetch_all(&mut *tx).await? {
                    tracing::debug!(replica_id, se, lfn = %lfn, "reusing cached replica");
                    result.insert(
                        lfn,
                        ResolvedReplica {
                            replica_id,
                            origin: ReplicaOrigin::Existing,
                        },
                    );
                }
            }

            let now = OffsetDateTime::now_utc();
            for lfn in wanted {
                if result.contains_key(lfn) {
                    continue;
                }
                let created: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO cache_replicas
                        (replica_type, status, se, lfn, pfn, size, file_checksum, guid,
                         submit_time, last_update, links)
                    VALUES (?, 'New', ?, ?, '', 0, '', '', ?, ?, 0)
                    ON CONFLICT (se, lfn) DO NOTHING
                    RETURNING replica_id
                    "#,
                )
                .bind(replica_type)
                .bind(se)
                .bind(lfn)
                .bind(now)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;

                let resolved = match created {
                    Some(replica_id) => ResolvedReplica {
                        replica_id,
                        origin: ReplicaOrigin::New,
                    },
                    None => {
                        let replica_id: i64 = sqlx::query_scalar(
                            "SELECT replica_id FROM cache_replicas WHERE se = ? AND lfn = ?",
                        )
                        .bind(se)
                        .bind(lfn)
                        .fetch_one(&mut *tx)
                        .await?;
                        tracing::debug!(replica_id, se, lfn, "replica created concurrently");
                        ResolvedReplica {
                            replica_id,
                            origin: ReplicaOrigin::Existing,
                        }
                    }
                };
                result.insert(lfn.to_string(), resolved);
            }

            tx.commit().await?;
            Ok(result)
        }

        async fn update_replica_information(
            &self,
            entries: &[ReplicaResolution],
        ) -> MetadataResult<u64> {
            if entries.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;
            for entry in entries {
                let rows = sqlx::query(
                    r#"
                    UPDATE cache_replicas
                    SET pfn = ?, size = ?, status = 'Waiting', last_update = ?
                    WHERE replica_id = ? AND status IN ('New', 'Waiting')
                    "#,
                )
                .bind(&entry.pfn)
                .bind(entry.size)
                .bind(now)
                .bind(entry.replica_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if rows == 0 {
                    tracing::warn!(
                        replica_id = entry.replica_id,
                        "replica no longer awaits resolution, keeping its status"
                    );
                }
                updated += rows;
            }
            tx.commit().await?;
            Ok(updated)
        }

        async fn update_replica_failure(
            &self,
            failures: &BTreeMap<ReplicaId, String>,
        ) -> MetadataResult<u64> {
            if failures.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;
            for (replica_id, reason) in failures {
                updated += sqlx::query(
                    "UPDATE cache_replicas SET status = 'Failed', reason = ?, last_update = ? WHERE replica_id = ?",
                )
                .bind(reason)
                .bind(now)
                .bind(replica_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;

            tracing::info!(replicas = updated, "marked replicas failed");
            Ok(updated)
        }

        async fn update_replica_status(
            &self,
            replica_ids: &[ReplicaId],
            to: ReplicaStatus,
        ) -> MetadataResult<Vec<ReplicaId>> {
            let from = ReplicaStatus::predecessors(to);
            if from.is_empty() {
                return Err(MetadataError::InvalidStateTransition {
                    from: "any".to_string(),
                    to: to.to_string(),
                });
            }
            if replica_ids.is_empty() {
                return Ok(Vec::new());
            }

            let from: Vec<&str> = from.iter().map(ReplicaStatus::as_str).collect();
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut moved = Vec::new();
            for batch in replica_ids.chunks(BATCH_SIZE) {
                let sql = format!(
                    "UPDATE cache_replicas SET status = ?, last_update = ? \
                     WHERE replica_id IN ({}) AND status IN ({}) RETURNING replica_id",
                    placeholders(batch.len()),
                    status_list(&from)
                );
                let mut query = sqlx::query_scalar::<_, i64>(&sql)
                    .bind(to.as_str())
                    .bind(now);
                for id in batch {
                    query = query.bind(id);
                }
                moved.extend(query.fetch_all(&mut *tx).await?);
            }
            tx.commit().await?;

            moved.sort_unstable();
            if moved.len() < replica_ids.len() {
                tracing::debug!(
                    to = %to,
                    requested = replica_ids.len(),
                    moved = moved.len(),
                    "skipped replicas that cannot move to the target status"
                );
            }
            Ok(moved)
        }

        async fn get_cache_replicas(
            &self,
            query: &ReplicaQuery,
        ) -> MetadataResult<Vec<CacheReplicaRow>> {
            let filter = &query.filter;
            if filter.matches_nothing() {
                return Ok(Vec::new());
            }

            let linked = match &filter.task_ids {
                Some(task_ids) => Some(self.replica_ids_for_tasks(task_ids).await?),
                None => None,
            };
            let replica_ids = query.effective_replica_ids(linked.as_ref());
            if replica_ids.as_ref().is_some_and(Vec::is_empty) {
                return Ok(Vec::new());
            }

            let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM cache_replicas WHERE 1 = 1");
            // Id and lfn lists go in as one JSON array each so their length
            // is not bounded by the bind limit.
            if let Some(ids) = &replica_ids {
                builder
                    .push(" AND replica_id IN (SELECT value FROM json_each(")
                    .push_bind(json_list(ids)?)
                    .push("))");
            }
            if let Some(statuses) = &filter.statuses {
                builder.push(" AND status IN (");
                let mut list = builder.separated(", ");
                for status in statuses {
                    list.push_bind(status.as_str());
                }
                list.push_unseparated(")");
            }
            if let Some(se) = &filter.se {
                builder.push(" AND se = ").push_bind(se.as_str());
            }
            if let Some(lfns) = &filter.lfns {
                builder
                    .push(" AND lfn IN (SELECT value FROM json_each(")
                    .push_bind(json_list(lfns)?)
                    .push("))");
            }
            if let Some(replica_type) = &filter.replica_type {
                builder
                    .push(" AND replica_type = ")
                    .push_bind(replica_type.as_str());
            }

            let column = query.timestamp.column();
            if let Some(older_than) = query.older_than {
                builder
                    .push(format!(" AND julianday({column}) < julianday("))
                    .push_bind(older_than)
                    .push(")");
            }
            if let Some(newer_than) = query.newer_than {
                builder
                    .push(format!(" AND julianday({column}) > julianday("))
                    .push_bind(newer_than)
                    .push(")");
            }

            let direction = if query.descending { "DESC" } else { "ASC" };
            match query.order_by {
                Some(order_by) => builder.push(format!(
                    " ORDER BY {} {direction}, replica_id {direction}",
                    order_by.column()
                )),
                None => builder.push(format!(" ORDER BY replica_id {direction}")),
            };
            if let Some(limit) = query.limit {
                builder.push(" LIMIT ").push_bind(i64::from(limit));
            }

            Ok(builder
                .build_query_as::<CacheReplicaRow>()
                .fetch_all(&self.pool)
                .await?)
        }

        async fn get_waiting_replicas(
            &self,
        ) -> MetadataResult<BTreeMap<ReplicaId, WaitingReplica>> {
            let blocking: Vec<&str> = ReplicaStatus::ALL
                .iter()
                .filter(|s| s.blocks_submission())
                .map(ReplicaStatus::as_str)
                .collect();
            let sql = format!(
                r#"
                SELECT DISTINCT r.replica_id, r.lfn, r.se, r.size, r.pfn
                FROM cache_replicas r
                JOIN task_replicas tr ON tr.replica_id = r.replica_id
                WHERE r.status = 'Waiting'
                  AND tr.task_id NOT IN (
                      SELECT btr.task_id
                      FROM task_replicas btr
                      JOIN cache_replicas br ON br.replica_id = btr.replica_id
                      WHERE br.status IN ({})
                  )
                "#,
                status_list(&blocking)
            );
            let rows: Vec<(i64, String, String, i64, String)> =
                sqlx::query_as(&sql).fetch_all(&self.pool).await?;

            Ok(rows
                .into_iter()
                .map(|(replica_id, lfn, se, size, pfn)| {
                    (replica_id, WaitingReplica { lfn, se, size, pfn })
                })
                .collect())
        }

        async fn get_submitted_stage_pins(
            &self,
        ) -> MetadataResult<BTreeMap<String, StagePinUsage>> {
            let excluded: Vec<&str> = ReplicaStatus::ALL
                .iter()
                .filter(|s| !s.counts_against_pin_quota())
                .map(ReplicaStatus::as_str)
                .collect();
            let sql = format!(
                "SELECT se, COUNT(*), COALESCE(SUM(size), 0) FROM cache_replicas \
                 WHERE status NOT IN ({}) GROUP BY se",
                status_list(&excluded)
            );
            let rows: Vec<(String, i64, i64)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

            Ok(rows
                .into_iter()
                .map(|(se, replicas, total_size)| {
                    (
                        se,
                        StagePinUsage {
                            replicas: count(replicas),
                            total_size: count(total_size),
                        },
                    )
                })
                .collect())
        }

        async fn remove_unlinked_replicas(&self) -> MetadataResult<Vec<ReplicaId>> {
            let mut tx = self.pool.begin().await?;
            let candidates: Vec<i64> =
                sqlx::query_scalar("SELECT replica_id FROM cache_replicas WHERE links = 0")
                    .fetch_all(&mut *tx)
                    .await?;
            if candidates.is_empty() {
                tx.commit().await?;
                return Ok(Vec::new());
            }

            let deleted = delete_unlinked_in(&mut tx, &candidates).await?;
            tx.commit().await?;

            tracing::info!(
                candidates = candidates.len(),
                deleted = deleted.len(),
                "removed unlinked replicas"
            );
            Ok(deleted)
        }

        async fn verify_link_counts(&self, mode: LinkCheckMode) -> MetadataResult<LinkCheckReport> {
            let mut tx = self.pool.begin().await?;
            let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
                r#"
                SELECT r.replica_id, r.links,
                       (SELECT COUNT(*) FROM task_replicas tr WHERE tr.replica_id = r.replica_id)
                FROM cache_replicas r
                ORDER BY r.replica_id
                "#,
            )
            .fetch_all(&mut *tx)
            .await?;

            let discrepancies: Vec<LinkDiscrepancy> = rows
                .iter()
                .filter(|(_, stored, computed)| stored != computed)
                .map(|&(replica_id, stored_links, computed_links)| LinkDiscrepancy {
                    replica_id,
                    stored_links,
                    computed_links,
                })
                .collect();

            let mut corrected = 0;
            if mode == LinkCheckMode::Correct && !discrepancies.is_empty() {
                let ids: Vec<ReplicaId> = discrepancies.iter().map(|d| d.replica_id).collect();
                refresh_links(&mut tx, &ids).await?;
                corrected = ids.len() as u64;
            }
            tx.commit().await?;

            for d in &discrepancies {
                tracing::warn!(
                    replica_id = d.replica_id,
                    stored = d.stored_links,
                    computed = d.computed_links,
                    "link count mismatch"
                );
            }
            Ok(LinkCheckReport {
                replicas_verified: rows.len() as u64,
                discrepancies,
                corrected,
            })
        }
    }

    #[async_trait]
    impl StageRequestRepo for SqliteStore {
        async fn insert_stage_request(
            &self,
            requests: &BTreeMap<String, Vec<ReplicaId>>,
            pin_lifetime_secs: u64,
        ) -> MetadataResult<u64> {
            let pin_length = i64::try_from(pin_lifetime_secs).map_err(|_| {
                MetadataError::InvalidInput(format!("pin lifetime {pin_lifetime_secs}s out of range"))
            })?;
            let covered: BTreeSet<ReplicaId> = requests.values().flatten().copied().collect();
            if covered.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let covered: Vec<ReplicaId> = covered.into_iter().collect();
            let mut statuses = BTreeMap::new();
            for batch in covered.chunks(BATCH_SIZE) {
                let sql = format!(
                    "SELECT replica_id, status FROM cache_replicas WHERE replica_id IN ({})",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
                for id in batch {
                    query = query.bind(id);
                }
                statuses.extend(query.fetch_all(&mut *tx).await?);
            }
            let missing: Vec<ReplicaId> = covered
                .iter()
                .filter(|id| !statuses.contains_key(*id))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(MetadataError::NotFound(format!(
                    "replicas {}",
                    format_ids(&missing)
                )));
            }
            let mut eligible = BTreeSet::new();
            let mut skipped = Vec::new();
            for (id, status) in &statuses {
                if status.parse::<ReplicaStatus>()?.accepts_stage_request() {
                    eligible.insert(*id);
                } else {
                    skipped.push(*id);
                }
            }
            if !skipped.is_empty() {
                tracing::warn!(
                    skipped = skipped.len(),
                    replicas = %format_ids(&skipped),
                    "ignoring stage requests for replicas that are not waiting"
                );
            }

            let mut inserted = 0;
            for (request_id, replica_ids) in requests {
                for replica_id in replica_ids.iter().filter(|id| eligible.contains(*id)) {
                    inserted += sqlx::query(
                        r#"
                        INSERT INTO stage_requests
                            (replica_id, request_id, stage_request_submit_time, pin_length, stage_status)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT (replica_id, request_id) DO NOTHING
                        "#,
                    )
                    .bind(replica_id)
                    .bind(request_id)
                    .bind(now)
                    .bind(pin_length)
                    .bind(StageStatus::StageSubmitted.as_str())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
            }

            for batch in covered.chunks(BATCH_SIZE) {
                let sql = format!(
                    "UPDATE cache_replicas SET status = 'StageSubmitted', last_update = ? \
                     WHERE replica_id IN ({}) AND status = 'Waiting'",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query(&sql).bind(now);
                for id in batch {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;

            tracing::info!(
                requests = requests.len(),
                rows = inserted,
                pin_length,
                "recorded stage requests"
            );
            Ok(inserted)
        }

        async fn get_stage_submitted_replicas(
            &self,
        ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
            requested_replicas(&self.pool, ReplicaStatus::StageSubmitted).await
        }

        async fn set_stage_complete(
            &self,
            replica_ids: &[ReplicaId],
            policy: PinExpiryPolicy,
        ) -> MetadataResult<u64> {
            if replica_ids.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;
            for batch in replica_ids.chunks(BATCH_SIZE) {
                let sql = format!(
                    "SELECT replica_id, request_id, pin_length FROM stage_requests \
                     WHERE replica_id IN ({}) AND stage_status = 'StageSubmitted'",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_as::<_, (i64, String, i64)>(&sql);
                for id in batch {
                    query = query.bind(id);
                }
                let open = query.fetch_all(&mut *tx).await?;

                for (replica_id, request_id, pin_length) in open {
                    updated += sqlx::query(
                        r#"
                        UPDATE stage_requests
                        SET stage_status = 'Staged', stage_request_completed_time = ?, pin_expiry_time = ?
                        WHERE replica_id = ? AND request_id = ?
                        "#,
                    )
                    .bind(now)
                    .bind(policy.expiry(now, pin_length))
                    .bind(replica_id)
                    .bind(&request_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }

                let sql = format!(
                    "UPDATE cache_replicas SET status = 'Staged', last_update = ? \
                     WHERE replica_id IN ({}) AND status = 'StageSubmitted'",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query(&sql).bind(now);
                for id in batch {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;

            tracing::info!(replicas = replica_ids.len(), requests = updated, "stage requests completed");
            Ok(updated)
        }

        async fn get_staged_replicas(
            &self,
        ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
            requested_replicas(&self.pool, ReplicaStatus::Staged).await
        }

        async fn get_stage_requests(
            &self,
            replica_ids: &[ReplicaId],
        ) -> MetadataResult<Vec<StageRequestRow>> {
            let mut rows = Vec::new();
            for batch in replica_ids.chunks(BATCH_SIZE) {
                let sql = format!(
                    "SELECT * FROM stage_requests WHERE replica_id IN ({}) ORDER BY replica_id, rowid",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_as::<_, StageRequestRow>(&sql);
                for id in batch {
                    query = query.bind(id);
                }
                rows.extend(query.fetch_all(&self.pool).await?);
            }
            Ok(rows)
        }
    }

    /// Replicas in `status` joined to their stage requests. When a replica
    /// has several requests, the most recently submitted one wins.
    ///
    /// Timestamps are RFC 3339 text with a variable number of fractional
    /// digits, so insertion order stands in for submission order.
    async fn requested_replicas(
        pool: &Pool<Sqlite>,
        status: ReplicaStatus,
    ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
        let rows: Vec<(i64, String, String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT r.replica_id, r.lfn, r.se, r.pfn, r.size, s.request_id
            FROM cache_replicas r
            JOIN stage_requests s ON s.replica_id = r.replica_id
            WHERE r.status = ?
            ORDER BY r.replica_id, s.rowid
            "#,
        )
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(replica_id, lfn, se, pfn, size, request_id)| {
                (
                    replica_id,
                    RequestedReplica {
                        lfn,
                        se,
                        pfn,
                        size,
                        request_id,
                    },
                )
            })
            .collect())
    }
}

const SCHEMA_SQL: &str = r#"
-- Staging tasks submitted by consumers
CREATE TABLE IF NOT EXISTS tasks (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    callback_method TEXT NOT NULL,
    source_task_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'Submitted',
    submit_time TEXT NOT NULL,
    complete_time TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

-- One row per (storage element, LFN) ever requested
CREATE TABLE IF NOT EXISTS cache_replicas (
    replica_id INTEGER PRIMARY KEY AUTOINCREMENT,
    replica_type TEXT NOT NULL DEFAULT 'Stage',
    status TEXT NOT NULL DEFAULT 'New',
    se TEXT NOT NULL,
    lfn TEXT NOT NULL,
    pfn TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    file_checksum TEXT NOT NULL DEFAULT '',
    guid TEXT NOT NULL DEFAULT '',
    submit_time TEXT NOT NULL,
    last_update TEXT NOT NULL,
    reason TEXT,
    links INTEGER NOT NULL DEFAULT 0,
    UNIQUE (se, lfn)
);
CREATE INDEX IF NOT EXISTS idx_cache_replicas_status ON cache_replicas(status);
CREATE INDEX IF NOT EXISTS idx_cache_replicas_links ON cache_replicas(links);

-- Task to replica links
CREATE TABLE IF NOT EXISTS task_replicas (
    task_id INTEGER NOT NULL REFERENCES tasks(task_id),
    replica_id INTEGER NOT NULL REFERENCES cache_replicas(replica_id),
    PRIMARY KEY (task_id, replica_id)
);
CREATE INDEX IF NOT EXISTS idx_task_replicas_replica ON task_replicas(replica_id);

-- Stage requests issued to storage backends
CREATE TABLE IF NOT EXISTS stage_requests (
    replica_id INTEGER NOT NULL REFERENCES cache_replicas(replica_id),
    request_id TEXT NOT NULL,
    stage_request_submit_time TEXT NOT NULL,
    pin_length INTEGER NOT NULL,
    stage_status TEXT NOT NULL DEFAULT 'StageSubmitted',
    stage_request_completed_time TEXT,
    pin_expiry_time TEXT,
    PRIMARY KEY (replica_id, request_id)
);
"#;
