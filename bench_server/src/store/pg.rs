//! PostgreSQL store over a diesel-async deadpool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text, Timestamptz};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use super::{DataFilter, ResultFilter, Store, TestJobFilter};
use crate::error::{StoreError, StoreResult};
use crate::models::benchmark::{Benchmark, NewBenchmark};
use crate::models::environment::{Environment, NewEnvironment};
use crate::models::manifest::{Manifest, ManifestReduced, NewManifest, NewManifestReduced};
use crate::models::result::{BenchResult, NewBenchResult, ResultChanges};
use crate::models::result_data::{NamedResultData, NewResultData, ResultData};
use crate::models::task::{ClaimedTask, NewScheduledTask, TASK_DONE, TASK_FAILED, TASK_PENDING};
use crate::models::test_job::{NewTestJob, TestJob, TestJobUpdate};
use crate::scheduler::TaskQueue;
use crate::schema::{
    benchmarks, environments, manifest_reduced, manifests, result_data, results, scheduled_tasks,
    test_jobs,
};

pub type PgPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Round-trip a trivial query; used by the health endpoint.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::sql_query("SELECT 1").execute(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn manifest_by_hash(&self, hash: &str) -> StoreResult<Option<Manifest>> {
        let mut conn = self.conn().await?;
        let found = manifests::table
            .filter(manifests::manifest_hash.eq(hash))
            .select(Manifest::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_manifest(&self, new: NewManifest) -> StoreResult<Manifest> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(manifests::table)
            .values(&new)
            .returning(Manifest::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn manifest_reduced_by_hash(&self, hash: &str) -> StoreResult<Option<ManifestReduced>> {
        let mut conn = self.conn().await?;
        let found = manifest_reduced::table
            .filter(manifest_reduced::hash.eq(hash))
            .select(ManifestReduced::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_manifest_reduced(
        &self,
        new: NewManifestReduced,
    ) -> StoreResult<ManifestReduced> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(manifest_reduced::table)
            .values(&new)
            .returning(ManifestReduced::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn result(&self, id: i64) -> StoreResult<Option<BenchResult>> {
        let mut conn = self.conn().await?;
        let found = results::table
            .find(id)
            .select(BenchResult::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn result_by_key(&self, name: &str, build_id: i64) -> StoreResult<Option<BenchResult>> {
        let mut conn = self.conn().await?;
        let found = results::table
            .filter(results::name.eq(name))
            .filter(results::build_id.eq(build_id))
            .select(BenchResult::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_result(&self, new: NewBenchResult) -> StoreResult<BenchResult> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(results::table)
            .values(&new)
            .returning(BenchResult::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn update_result(&self, id: i64, changes: ResultChanges) -> StoreResult<BenchResult> {
        let mut conn = self.conn().await?;
        let row = diesel::update(results::table.find(id))
            .set(&changes)
            .returning(BenchResult::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn set_annotation(&self, id: i64, annotation: Option<String>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(results::table.find(id))
            .set(results::annotation.eq(annotation))
            .execute(&mut conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("result {id}")));
        }
        Ok(())
    }

    async fn set_result_flags(&self, id: i64, completed: bool, reported: bool) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(results::table.find(id))
            .set((
                results::completed.eq(completed),
                results::reported.eq(reported),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_results(&self, filter: &ResultFilter) -> StoreResult<Vec<BenchResult>> {
        let mut conn = self.conn().await?;
        let mut query = results::table.into_boxed::<Pg>();

        if let Some(branch) = &filter.branch {
            query = query.filter(results::branch_name.eq(branch.clone()));
        }
        if let Some(name) = &filter.name {
            query = query.filter(results::name.eq(name.clone()));
        }
        if let Some(hash) = &filter.manifest_hash {
            query = query.filter(
                results::manifest_id.eq_any(
                    manifests::table
                        .filter(manifests::manifest_hash.eq(hash.clone()))
                        .select(manifests::id),
                ),
            );
        }
        if let Some(from) = filter.created_from {
            query = query.filter(results::created_at.ge(from));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(results::created_at.lt(before));
        }
        if let Some(until) = filter.created_until {
            query = query.filter(results::created_at.le(until));
        }
        if filter.exclude_gerrit {
            query = query.filter(results::gerrit_change_number.is_null());
        }
        if filter.annotated_only {
            query = query.filter(results::annotation.is_not_null());
        }
        if filter.unreported_only {
            query = query.filter(results::reported.eq(false));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        let rows = query
            .order((results::created_at.desc(), results::id.desc()))
            .load::<BenchResult>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn environment_by_identifier(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<Environment>> {
        let mut conn = self.conn().await?;
        let found = environments::table
            .filter(environments::identifier.eq(identifier))
            .select(Environment::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_environment(&self, new: NewEnvironment) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(environments::table)
            .values(&new)
            .returning(Environment::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn environments(&self, ids: &[i64]) -> StoreResult<Vec<Environment>> {
        let mut conn = self.conn().await?;
        let rows = environments::table
            .filter(environments::id.eq_any(ids.to_vec()))
            .order(environments::identifier.asc())
            .select(Environment::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn benchmark_by_name(&self, name: &str) -> StoreResult<Option<Benchmark>> {
        let mut conn = self.conn().await?;
        let found = benchmarks::table
            .filter(benchmarks::name.eq(name))
            .select(Benchmark::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_benchmark(&self, new: NewBenchmark) -> StoreResult<Benchmark> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(benchmarks::table)
            .values(&new)
            .returning(Benchmark::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn test_job(&self, id: &str) -> StoreResult<Option<TestJob>> {
        let mut conn = self.conn().await?;
        let found = test_jobs::table
            .find(id)
            .select(TestJob::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found)
    }

    async fn insert_test_job(&self, new: NewTestJob) -> StoreResult<TestJob> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(test_jobs::table)
            .values(&new)
            .returning(TestJob::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn update_test_job(&self, id: &str, update: TestJobUpdate) -> StoreResult<TestJob> {
        let mut conn = self.conn().await?;
        let row = diesel::update(test_jobs::table.find(id))
            .set(&update)
            .returning(TestJob::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn set_resubmitted(&self, id: &str, value: bool) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let changed = diesel::update(
            test_jobs::table
                .find(id)
                .filter(test_jobs::resubmitted.eq(!value)),
        )
        .set(test_jobs::resubmitted.eq(value))
        .execute(&mut conn)
        .await?;
        Ok(changed == 1)
    }

    async fn test_jobs_for_result(&self, result_id: i64) -> StoreResult<Vec<TestJob>> {
        let mut conn = self.conn().await?;
        let rows = test_jobs::table
            .filter(test_jobs::result_id.eq(result_id))
            .order((test_jobs::created_at.desc(), test_jobs::id.asc()))
            .select(TestJob::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn find_test_jobs(&self, filter: &TestJobFilter) -> StoreResult<Vec<TestJob>> {
        let mut conn = self.conn().await?;
        let mut query = test_jobs::table
            .inner_join(results::table)
            .left_join(environments::table)
            .select(TestJob::as_select())
            .into_boxed::<Pg>();

        if let Some(env) = &filter.environment {
            query = query.filter(environments::identifier.eq(env.clone()));
        }
        if let Some(branch) = &filter.branch {
            query = query.filter(results::branch_name.eq(branch.clone()));
        }
        if filter.exclude_gerrit {
            query = query.filter(results::gerrit_change_number.is_null());
        }
        if let Some(completed) = filter.completed {
            query = query.filter(test_jobs::completed.eq(completed));
        }

        let rows = query
            .order((test_jobs::created_at.asc(), test_jobs::id.asc()))
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn complete_test_job(
        &self,
        id: &str,
        update: TestJobUpdate,
        rows: Vec<NewResultData>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let id = id.to_string();
        conn.transaction::<bool, StoreError, _>(|conn| {
            async move {
                let already: bool = test_jobs::table
                    .find(id.as_str())
                    .select(test_jobs::completed)
                    .for_update()
                    .first(conn)
                    .await?;
                if already {
                    return Ok(false);
                }
                diesel::update(test_jobs::table.find(id.as_str()))
                    .set(&update)
                    .execute(conn)
                    .await?;
                if !rows.is_empty() {
                    diesel::insert_into(result_data::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }
                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_result_data(&self, filter: &DataFilter) -> StoreResult<Vec<NamedResultData>> {
        let mut conn = self.conn().await?;
        let mut query = result_data::table
            .inner_join(benchmarks::table)
            .select((benchmarks::name, ResultData::as_select()))
            .into_boxed::<Pg>();

        if let Some(ids) = &filter.result_ids {
            query = query.filter(result_data::result_id.eq_any(ids.clone()));
        }
        if let Some(ids) = &filter.test_job_ids {
            query = query.filter(result_data::test_job_id.eq_any(ids.clone()));
        }
        if let Some(names) = &filter.benchmarks {
            query = query.filter(benchmarks::name.eq_any(names.clone()));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(result_data::created_at.gt(after));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(result_data::created_at.lt(before));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        let rows: Vec<(String, ResultData)> = query
            .order((result_data::created_at.desc(), result_data::id.desc()))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(benchmark, data)| NamedResultData { benchmark, data })
            .collect())
    }
}

const CLAIM_SQL: &str = "\
UPDATE scheduled_tasks \
   SET status = 'running', locked_by = $1, locked_at = $2, attempts = attempts + 1 \
 WHERE id IN ( \
    SELECT id FROM scheduled_tasks \
     WHERE (status = 'pending' AND not_before <= $2) \
        OR (status = 'running' AND locked_at < $3) \
     ORDER BY not_before, id \
     LIMIT $4 \
     FOR UPDATE SKIP LOCKED) \
RETURNING id, payload, attempts";

#[async_trait]
impl TaskQueue for PgStore {
    async fn enqueue(&self, task: NewScheduledTask) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let id = diesel::insert_into(scheduled_tasks::table)
            .values(&task)
            .returning(scheduled_tasks::id)
            .get_result(&mut conn)
            .await?;
        Ok(id)
    }

    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut conn = self.conn().await?;
        let claimed = diesel::sql_query(CLAIM_SQL)
            .bind::<Text, _>(worker)
            .bind::<Timestamptz, _>(now)
            .bind::<Timestamptz, _>(stale_before)
            .bind::<BigInt, _>(limit)
            .load::<ClaimedTask>(&mut conn)
            .await?;
        Ok(claimed)
    }

    async fn complete(&self, id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(scheduled_tasks::table.find(id))
            .set((
                scheduled_tasks::status.eq(TASK_DONE),
                scheduled_tasks::locked_by.eq(None::<String>),
                scheduled_tasks::locked_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, id: i64, not_before: DateTime<Utc>, error: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(scheduled_tasks::table.find(id))
            .set((
                scheduled_tasks::status.eq(TASK_PENDING),
                scheduled_tasks::not_before.eq(not_before),
                scheduled_tasks::last_error.eq(error),
                scheduled_tasks::locked_by.eq(None::<String>),
                scheduled_tasks::locked_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: i64, error: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(scheduled_tasks::table.find(id))
            .set((
                scheduled_tasks::status.eq(TASK_FAILED),
                scheduled_tasks::last_error.eq(error),
                scheduled_tasks::locked_by.eq(None::<String>),
                scheduled_tasks::locked_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
