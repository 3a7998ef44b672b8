//! Persistence boundary for the benchmark engine.
//!
//! Services talk to [`Store`] rather than to a connection so the
//! reconciliation and comparison logic runs unchanged against PostgreSQL
//! ([`pg::PgStore`]) and the in-memory store used by tests.

#[cfg(test)]
pub mod memory;
pub mod pg;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::models::benchmark::{Benchmark, NewBenchmark};
use crate::models::environment::{Environment, NewEnvironment};
use crate::models::manifest::{Manifest, ManifestReduced, NewManifest, NewManifestReduced};
use crate::models::result::{BenchResult, NewBenchResult, ResultChanges};
use crate::models::result_data::{NamedResultData, NewResultData};
use crate::models::test_job::{NewTestJob, TestJob, TestJobUpdate};

/// Result query. Rows come back newest first (`created_at`, then `id`).
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub branch: Option<String>,
    pub name: Option<String>,
    pub manifest_hash: Option<String>,
    /// Inclusive lower bound.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub created_before: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub created_until: Option<DateTime<Utc>>,
    /// Keep only merged baseline builds (no Gerrit change number).
    pub exclude_gerrit: bool,
    pub annotated_only: bool,
    /// Keep only results whose completion has not been reported.
    pub unreported_only: bool,
    pub limit: Option<i64>,
}

/// Result data query. Rows come back newest first.
#[derive(Debug, Clone, Default)]
pub struct DataFilter {
    pub result_ids: Option<Vec<i64>>,
    pub test_job_ids: Option<Vec<String>>,
    pub benchmarks: Option<Vec<String>>,
    /// Exclusive bounds.
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Test job query scoped by environment and the owning result's branch.
#[derive(Debug, Clone, Default)]
pub struct TestJobFilter {
    pub environment: Option<String>,
    pub branch: Option<String>,
    pub exclude_gerrit: bool,
    pub completed: Option<bool>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // manifests
    async fn manifest_by_hash(&self, hash: &str) -> StoreResult<Option<Manifest>>;
    async fn insert_manifest(&self, new: NewManifest) -> StoreResult<Manifest>;
    async fn manifest_reduced_by_hash(&self, hash: &str) -> StoreResult<Option<ManifestReduced>>;
    async fn insert_manifest_reduced(&self, new: NewManifestReduced)
        -> StoreResult<ManifestReduced>;

    // results
    async fn result(&self, id: i64) -> StoreResult<Option<BenchResult>>;
    async fn result_by_key(&self, name: &str, build_id: i64) -> StoreResult<Option<BenchResult>>;
    async fn insert_result(&self, new: NewBenchResult) -> StoreResult<BenchResult>;
    async fn update_result(&self, id: i64, changes: ResultChanges) -> StoreResult<BenchResult>;
    async fn set_annotation(&self, id: i64, annotation: Option<String>) -> StoreResult<()>;
    async fn set_result_flags(&self, id: i64, completed: bool, reported: bool)
        -> StoreResult<()>;
    async fn find_results(&self, filter: &ResultFilter) -> StoreResult<Vec<BenchResult>>;

    // environments and benchmarks
    async fn environment_by_identifier(&self, identifier: &str)
        -> StoreResult<Option<Environment>>;
    async fn insert_environment(&self, new: NewEnvironment) -> StoreResult<Environment>;
    async fn environments(&self, ids: &[i64]) -> StoreResult<Vec<Environment>>;
    async fn benchmark_by_name(&self, name: &str) -> StoreResult<Option<Benchmark>>;
    async fn insert_benchmark(&self, new: NewBenchmark) -> StoreResult<Benchmark>;

    // test jobs
    async fn test_job(&self, id: &str) -> StoreResult<Option<TestJob>>;
    async fn insert_test_job(&self, new: NewTestJob) -> StoreResult<TestJob>;
    async fn update_test_job(&self, id: &str, update: TestJobUpdate) -> StoreResult<TestJob>;
    /// Set the resubmit latch to `value` only if it holds the opposite.
    /// Returns whether this call changed it.
    async fn set_resubmitted(&self, id: &str, value: bool) -> StoreResult<bool>;
    async fn test_jobs_for_result(&self, result_id: i64) -> StoreResult<Vec<TestJob>>;
    async fn find_test_jobs(&self, filter: &TestJobFilter) -> StoreResult<Vec<TestJob>>;

    /// Write `update` and insert `rows` in one transaction, but only if the
    /// job is not already completed. Returns whether anything was written.
    async fn complete_test_job(
        &self,
        id: &str,
        update: TestJobUpdate,
        rows: Vec<NewResultData>,
    ) -> StoreResult<bool>;

    // result data
    async fn find_result_data(&self, filter: &DataFilter) -> StoreResult<Vec<NamedResultData>>;
}

/// Look up, else create; a create that loses a uniqueness race re-reads.
///
/// Returns the row and whether this call created it.
pub async fn get_or_create<T, G, GF, C, CF>(get: G, create: C) -> StoreResult<(T, bool)>
where
    G: Fn() -> GF,
    GF: Future<Output = StoreResult<Option<T>>>,
    C: FnOnce() -> CF,
    CF: Future<Output = StoreResult<T>>,
{
    if let Some(found) = get().await? {
        return Ok((found, false));
    }
    match create().await {
        Ok(created) => Ok((created, true)),
        Err(StoreError::Conflict(msg)) => match get().await? {
            Some(found) => Ok((found, false)),
            None => Err(StoreError::Conflict(msg)),
        },
        Err(e) => Err(e),
    }
}

/// Get-or-create an environment by identifier.
pub async fn environment<S: Store + ?Sized>(store: &S, identifier: &str) -> StoreResult<Environment> {
    let (env, created) = get_or_create(
        || store.environment_by_identifier(identifier),
        || {
            store.insert_environment(NewEnvironment {
                identifier: identifier.to_string(),
                name: identifier.to_string(),
            })
        },
    )
    .await?;
    if created {
        tracing::info!(environment = %env.identifier, "Environment registered");
    }
    Ok(env)
}

/// Get-or-create a benchmark by name.
pub async fn benchmark<S: Store + ?Sized>(store: &S, name: &str) -> StoreResult<Benchmark> {
    let (bench, _) = get_or_create(
        || store.benchmark_by_name(name),
        || {
            store.insert_benchmark(NewBenchmark {
                name: name.to_string(),
            })
        },
    )
    .await?;
    Ok(bench)
}
