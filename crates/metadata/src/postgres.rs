//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, classify, format_ids};
use crate::models::*;
use crate::repos::{
    LinkCheckMode, LinkCheckReport, LinkDiscrepancy, LinkRepo, ReplicaQuery, ReplicaRepo,
    ReplicaResolution, StageRequestRepo, TaskRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres, QueryBuilder};
use stager_core::config::PgSslMode;
use stager_core::{
    PinExpiryPolicy, ReplicaId, ReplicaOrigin, ReplicaStatus, StageStatus, TaskCallback, TaskId,
    TaskStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn status_names<S: AsRef<str>>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(|s| s.as_ref().to_string()).collect()
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from the environment rather than a URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Link counts are recomputed from the link table. Under READ COMMITTED a
// recount only sees concurrent links once their writers commit, so every
// writer of task_replicas first locks the affected replica rows, always in
// replica_id order.

/// Lock replica rows, returning the ids that still exist.
async fn lock_replicas(
    conn: &mut PgConnection,
    replica_ids: &[ReplicaId],
) -> MetadataResult<BTreeSet<ReplicaId>> {
    let locked: Vec<i64> = sqlx::query_scalar(
        "SELECT replica_id FROM cache_replicas WHERE replica_id = ANY($1) ORDER BY replica_id FOR UPDATE",
    )
    .bind(replica_ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(locked.into_iter().collect())
}

async fn refresh_links(conn: &mut PgConnection, replica_ids: &[ReplicaId]) -> MetadataResult<()> {
    sqlx::query(
        r#"
        UPDATE cache_replicas SET links =
            (SELECT COUNT(*) FROM task_replicas tr WHERE tr.replica_id = cache_replicas.replica_id)
        WHERE replica_id = ANY($1)
        "#,
    )
    .bind(replica_ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn linked_replicas(
    conn: &mut PgConnection,
    task_ids: &[TaskId],
) -> MetadataResult<BTreeSet<ReplicaId>> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT DISTINCT replica_id FROM task_replicas WHERE task_id = ANY($1)")
            .bind(task_ids)
            .fetch_all(&mut *conn)
            .await?;
    Ok(ids.into_iter().collect())
}

async fn unlink_in(conn: &mut PgConnection, task_ids: &[TaskId]) -> MetadataResult<u64> {
    let affected: Vec<ReplicaId> = linked_replicas(conn, task_ids).await?.into_iter().collect();
    lock_replicas(conn, &affected).await?;

    let removed = sqlx::query("DELETE FROM task_replicas WHERE task_id = ANY($1)")
        .bind(task_ids)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    refresh_links(conn, &affected).await?;
    Ok(removed)
}

async fn delete_unlinked_in(
    conn: &mut PgConnection,
    candidates: &[ReplicaId],
) -> MetadataResult<Vec<ReplicaId>> {
    let locked: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT replica_id FROM cache_replicas
        WHERE replica_id = ANY($1) AND links = 0
          AND NOT EXISTS (SELECT 1 FROM task_replicas tr WHERE tr.replica_id = cache_replicas.replica_id)
        ORDER BY replica_id
        FOR UPDATE
        "#,
    )
    .bind(candidates)
    .fetch_all(&mut *conn)
    .await?;
    if locked.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query("DELETE FROM stage_requests WHERE replica_id = ANY($1)")
        .bind(&locked)
        .execute(&mut *conn)
        .await?;

    let mut deleted: Vec<i64> = sqlx::query_scalar(
        r#"
        DELETE FROM cache_replicas
        WHERE replica_id = ANY($1) AND links = 0
          AND NOT EXISTS (SELECT 1 FROM task_replicas tr WHERE tr.replica_id = cache_replicas.replica_id)
        RETURNING replica_id
        "#,
    )
    .bind(&locked)
    .fetch_all(&mut *conn)
    .await?;
    deleted.sort_unstable();
    Ok(deleted)
}

#[async_trait]
impl TaskRepo for PostgresStore {
    async fn create_task(
        &self,
        source: &str,
        callback_method: &str,
        source_task_id: &str,
    ) -> MetadataResult<TaskId> {
        let task_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (source, callback_method, source_task_id, status, submit_time)
            VALUES ($1, $2, $3, $4, $5)
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
            "SELECT task_id, source, callback_method, source_task_id FROM tasks WHERE status = $1",
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
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
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
            WHERE tr.task_id = $1
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
        let mut moved: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET status = $1,
                complete_time = CASE WHEN $2 THEN COALESCE(complete_time, $3) ELSE complete_time END
            WHERE task_id = ANY($4) AND status = ANY($5)
            RETURNING task_id
            "#,
        )
        .bind(to.as_str())
        .bind(to == TaskStatus::Done)
        .bind(OffsetDateTime::now_utc())
        .bind(task_ids)
        .bind(status_names(&from))
        .fetch_all(&self.pool)
        .await?;

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
                   COALESCE(SUM(CASE WHEN r.status <> 'Staged' THEN 1 ELSE 0 END), 0)::BIGINT
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

        let updated = sqlx::query(
            "UPDATE tasks SET status = 'Done', complete_time = $1 WHERE task_id = ANY($2)",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(task_ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(tasks = updated, "marked tasks done");
        Ok(updated)
    }

    async fn remove_tasks(&self, task_ids: &[TaskId]) -> MetadataResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let links = unlink_in(&mut tx, task_ids).await?;
        let removed = sqlx::query("DELETE FROM tasks WHERE task_id = ANY($1)")
            .bind(task_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
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
        sqlx::query("DELETE FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
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
impl LinkRepo for PostgresStore {
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

        let present = lock_replicas(&mut tx, &wanted).await?;
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

        let inserted = sqlx::query(
            r#"
            INSERT INTO task_replicas (task_id, replica_id)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT (task_id, replica_id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(&wanted)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify("link", e))?
        .rows_affected();

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
impl ReplicaRepo for PostgresStore {
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

        let existing: Vec<(i64, String)> = sqlx::query_as(
            "SELECT replica_id, lfn FROM cache_replicas WHERE se = $1 AND lfn = ANY($2)",
        )
        .bind(se)
        .bind(&wanted)
        .fetch_all(&mut *tx)
        .await?;
        for (replica_id, lfn) in existing {
            tracing::debug!(replica_id, se, lfn = %lfn, "reusing cached replica");
            result.insert(
                lfn,
                ResolvedReplica {
                    replica_id,
                    origin: ReplicaOrigin::Existing,
                },
            );
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
                VALUES ($1, 'New', $2, $3, '', 0, '', '', $4, $4, 0)
                ON CONFLICT (se, lfn) DO NOTHING
                RETURNING replica_id
                "#,
            )
            .bind(replica_type)
            .bind(se)
            .bind(lfn)
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
                        "SELECT replica_id FROM cache_replicas WHERE se = $1 AND lfn = $2",
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
                SET pfn = $1, size = $2, status = 'Waiting', last_update = $3
                WHERE replica_id = $4 AND status IN ('New', 'Waiting')
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

        let ids: Vec<i64> = failures.keys().copied().collect();
        let reasons: Vec<&str> = failures.values().map(String::as_str).collect();
        let updated = sqlx::query(
            r#"
            UPDATE cache_replicas r
            SET status = 'Failed', reason = f.reason, last_update = $3
            FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS f(replica_id, reason)
            WHERE r.replica_id = f.replica_id
            "#,
        )
        .bind(&ids)
        .bind(&reasons)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?
        .rows_affected();

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
        let mut moved: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE cache_replicas SET status = $1, last_update = $2
            WHERE replica_id = ANY($3) AND status = ANY($4)
            RETURNING replica_id
            "#,
        )
        .bind(to.as_str())
        .bind(OffsetDateTime::now_utc())
        .bind(replica_ids)
        .bind(status_names(&from))
        .fetch_all(&self.pool)
        .await?;

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

    async fn get_cache_replicas(&self, query: &ReplicaQuery) -> MetadataResult<Vec<CacheReplicaRow>> {
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

        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM cache_replicas WHERE TRUE");
        if let Some(ids) = replica_ids {
            builder.push(" AND replica_id = ANY(").push_bind(ids).push(")");
        }
        if let Some(statuses) = &filter.statuses {
            let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(names).push(")");
        }
        if let Some(se) = &filter.se {
            builder.push(" AND se = ").push_bind(se.clone());
        }
        if let Some(lfns) = &filter.lfns {
            builder.push(" AND lfn = ANY(").push_bind(lfns.clone()).push(")");
        }
        if let Some(replica_type) = &filter.replica_type {
            builder
                .push(" AND replica_type = ")
                .push_bind(replica_type.clone());
        }

        let column = query.timestamp.column();
        if let Some(older_than) = query.older_than {
            builder
                .push(format!(" AND {column} < "))
                .push_bind(older_than);
        }
        if let Some(newer_than) = query.newer_than {
            builder
                .push(format!(" AND {column} > "))
                .push_bind(newer_than);
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

    async fn get_waiting_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, WaitingReplica>> {
        let blocking: Vec<&str> = ReplicaStatus::ALL
            .iter()
            .filter(|s| s.blocks_submission())
            .map(ReplicaStatus::as_str)
            .collect();
        let rows: Vec<(i64, String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT r.replica_id, r.lfn, r.se, r.size, r.pfn
            FROM cache_replicas r
            JOIN task_replicas tr ON tr.replica_id = r.replica_id
            WHERE r.status = 'Waiting'
              AND tr.task_id NOT IN (
                  SELECT btr.task_id
                  FROM task_replicas btr
                  JOIN cache_replicas br ON br.replica_id = btr.replica_id
                  WHERE br.status = ANY($1)
              )
            "#,
        )
        .bind(status_names(&blocking))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(replica_id, lfn, se, size, pfn)| (replica_id, WaitingReplica { lfn, se, size, pfn }))
            .collect())
    }

    async fn get_submitted_stage_pins(&self) -> MetadataResult<BTreeMap<String, StagePinUsage>> {
        let excluded: Vec<&str> = ReplicaStatus::ALL
            .iter()
            .filter(|s| !s.counts_against_pin_quota())
            .map(ReplicaStatus::as_str)
            .collect();
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT se, COUNT(*), COALESCE(SUM(size), 0)::BIGINT
            FROM cache_replicas
            WHERE NOT (status = ANY($1))
            GROUP BY se
            "#,
        )
        .bind(status_names(&excluded))
        .fetch_all(&self.pool)
        .await?;

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
            lock_replicas(&mut tx, &ids).await?;
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
impl StageRequestRepo for PostgresStore {
    async fn insert_stage_request(
        &self,
        requests: &BTreeMap<String, Vec<ReplicaId>>,
        pin_lifetime_secs: u64,
    ) -> MetadataResult<u64> {
        let pin_length = i64::try_from(pin_lifetime_secs).map_err(|_| {
            MetadataError::InvalidInput(format!("pin lifetime {pin_lifetime_secs}s out of range"))
        })?;

        let covered: Vec<ReplicaId> = requests
            .values()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if covered.is_empty() {
            return Ok(0);
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let statuses: BTreeMap<i64, String> = sqlx::query_as::<_, (i64, String)>(
            "SELECT replica_id, status FROM cache_replicas WHERE replica_id = ANY($1) \
             ORDER BY replica_id FOR UPDATE",
        )
        .bind(&covered)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();
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

        let mut replica_ids = Vec::new();
        let mut request_ids = Vec::new();
        for (request_id, ids) in requests {
            for id in ids.iter().filter(|id| eligible.contains(*id)) {
                replica_ids.push(*id);
                request_ids.push(request_id.as_str());
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO stage_requests
                (replica_id, request_id, stage_request_submit_time, pin_length, stage_status)
            SELECT r.replica_id, r.request_id, $3, $4, $5
            FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS r(replica_id, request_id)
            ON CONFLICT (replica_id, request_id) DO NOTHING
            "#,
        )
        .bind(&replica_ids)
        .bind(&request_ids)
        .bind(now)
        .bind(pin_length)
        .bind(StageStatus::StageSubmitted.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE cache_replicas SET status = 'StageSubmitted', last_update = $1
            WHERE replica_id = ANY($2) AND status = 'Waiting'
            "#,
        )
        .bind(now)
        .bind(&covered)
        .execute(&mut *tx)
        .await?;
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
        self.requested_replicas(ReplicaStatus::StageSubmitted).await
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
        let open: Vec<(i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT replica_id, request_id, pin_length FROM stage_requests
            WHERE replica_id = ANY($1) AND stage_status = 'StageSubmitted'
            FOR UPDATE
            "#,
        )
        .bind(replica_ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut updated = 0;
        for (replica_id, request_id, pin_length) in open {
            updated += sqlx::query(
                r#"
                UPDATE stage_requests
                SET stage_status = 'Staged', stage_request_completed_time = $1, pin_expiry_time = $2
                WHERE replica_id = $3 AND request_id = $4
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

        sqlx::query(
            r#"
            UPDATE cache_replicas SET status = 'Staged', last_update = $1
            WHERE replica_id = ANY($2) AND status = 'StageSubmitted'
            "#,
        )
        .bind(now)
        .bind(replica_ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(replicas = replica_ids.len(), requests = updated, "stage requests completed");
        Ok(updated)
    }

    async fn get_staged_replicas(&self) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
        self.requested_replicas(ReplicaStatus::Staged).await
    }

    async fn get_stage_requests(
        &self,
        replica_ids: &[ReplicaId],
    ) -> MetadataResult<Vec<StageRequestRow>> {
        Ok(sqlx::query_as::<_, StageRequestRow>(
            r#"
            SELECT * FROM stage_requests
            WHERE replica_id = ANY($1)
            ORDER BY replica_id, stage_request_submit_time
            "#,
        )
        .bind(replica_ids)
        .fetch_all(&self.pool)
        .await?)
    }
}

impl PostgresStore {
    async fn requested_replicas(
        &self,
        status: ReplicaStatus,
    ) -> MetadataResult<BTreeMap<ReplicaId, RequestedReplica>> {
        let rows: Vec<(i64, String, String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT r.replica_id, r.lfn, r.se, r.pfn, r.size, s.request_id
            FROM cache_replicas r
            JOIN stage_requests s ON s.replica_id = r.replica_id
            WHERE r.status = $1
            ORDER BY r.replica_id, s.stage_request_submit_time
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
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
