//! In-memory store and task queue for service tests.
//!
//! Mirrors the unique constraints of the SQL schema so get-or-create and the
//! ingestion retry loop see the same `Conflict` errors they would in
//! PostgreSQL. Conflicts can also be injected to simulate a racing writer.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DataFilter, ResultFilter, Store, TestJobFilter};
use crate::error::{StoreError, StoreResult};
use crate::models::benchmark::{Benchmark, NewBenchmark};
use crate::models::environment::{Environment, NewEnvironment};
use crate::models::manifest::{Manifest, ManifestReduced, NewManifest, NewManifestReduced};
use crate::models::result::{BenchResult, NewBenchResult, ResultChanges};
use crate::models::result_data::{NamedResultData, NewResultData, ResultData};
use crate::models::task::{
    ClaimedTask, NewScheduledTask, TASK_DONE, TASK_FAILED, TASK_PENDING, TASK_RUNNING,
};
use crate::models::test_job::{NewTestJob, TestJob, TestJobUpdate};
use crate::scheduler::TaskQueue;

/// A queued task as the in-memory queue holds it.
#[derive(Debug, Clone)]
pub struct MemoryTask {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub not_before: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// How an injected insert conflict behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedConflict {
    /// A competing writer inserts the row first; the caller sees `Conflict`.
    RacingWriter,
    /// The insert fails with `Conflict` and nothing is written.
    Spurious,
}

#[derive(Default)]
struct Tables {
    manifests: Vec<Manifest>,
    reduced: Vec<ManifestReduced>,
    results: Vec<BenchResult>,
    environments: Vec<Environment>,
    benchmarks: Vec<Benchmark>,
    test_jobs: Vec<TestJob>,
    result_data: Vec<ResultData>,
    tasks: Vec<MemoryTask>,
    next_id: i64,
    injected: Vec<InjectedConflict>,
    injected_manifest: Vec<InjectedConflict>,
    result_insert_attempts: u32,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn conflict(what: &str) -> StoreError {
    StoreError::Conflict(format!("duplicate key value violates unique constraint on {what}"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue conflicts for the next result inserts, consumed in order.
    pub fn inject_result_conflicts(&self, conflicts: &[InjectedConflict]) {
        self.lock().injected.extend_from_slice(conflicts);
    }

    /// Queue conflicts for the next manifest inserts, consumed in order.
    pub fn inject_manifest_conflicts(&self, conflicts: &[InjectedConflict]) {
        self.lock().injected_manifest.extend_from_slice(conflicts);
    }

    pub fn result_insert_attempts(&self) -> u32 {
        self.lock().result_insert_attempts
    }

    pub fn manifest_count(&self) -> usize {
        self.lock().manifests.len()
    }

    pub fn reduced_count(&self) -> usize {
        self.lock().reduced.len()
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }

    pub fn test_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().test_jobs.iter().map(|j| j.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn result_data_count(&self) -> usize {
        self.lock().result_data.len()
    }

    pub fn tasks(&self) -> Vec<MemoryTask> {
        self.lock().tasks.clone()
    }

    /// Insert a result with an explicit creation time, bypassing ingestion.
    pub fn seed_result(&self, mut new: NewBenchResult, created_at: DateTime<Utc>) -> BenchResult {
        new.created_at = created_at;
        let mut t = self.lock();
        let id = t.next_id();
        let row = result_from_new(id, new);
        t.results.push(row.clone());
        row
    }

    /// Insert result data directly with an explicit creation time.
    pub fn seed_result_data(&self, new: NewResultData, created_at: DateTime<Utc>) -> ResultData {
        let mut t = self.lock();
        let id = t.next_id();
        let row = data_from_new(id, new, created_at);
        t.result_data.push(row.clone());
        row
    }

    fn insert_manifest_row(t: &mut Tables, new: NewManifest) -> StoreResult<Manifest> {
        if t.manifests.iter().any(|m| m.manifest_hash == new.manifest_hash) {
            return Err(conflict("manifests.manifest_hash"));
        }
        let row = Manifest {
            id: t.next_id(),
            manifest: new.manifest,
            manifest_hash: new.manifest_hash,
            reduced_id: new.reduced_id,
        };
        t.manifests.push(row.clone());
        Ok(row)
    }

    fn insert_result_row(t: &mut Tables, new: NewBenchResult) -> StoreResult<BenchResult> {
        if t
            .results
            .iter()
            .any(|r| r.name == new.name && r.build_id == new.build_id)
        {
            return Err(conflict("results (name, build_id)"));
        }
        let id = t.next_id();
        let row = result_from_new(id, new);
        t.results.push(row.clone());
        Ok(row)
    }
}

fn result_from_new(id: i64, new: NewBenchResult) -> BenchResult {
    BenchResult {
        id,
        name: new.name,
        build_id: new.build_id,
        build_number: new.build_number,
        build_url: new.build_url,
        branch_name: new.branch_name,
        gerrit_change_number: new.gerrit_change_number,
        gerrit_patchset_number: new.gerrit_patchset_number,
        gerrit_change_id: new.gerrit_change_id,
        gerrit_change_url: new.gerrit_change_url,
        manifest_id: new.manifest_id,
        annotation: None,
        completed: false,
        reported: false,
        created_at: new.created_at,
    }
}

fn data_from_new(id: i64, new: NewResultData, created_at: DateTime<Utc>) -> ResultData {
    ResultData {
        id,
        benchmark_id: new.benchmark_id,
        result_id: new.result_id,
        test_job_id: new.test_job_id,
        name: new.name,
        values: new.values,
        board: new.board,
        created_at,
    }
}

fn newest_first<T>(rows: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, i64)) {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[async_trait]
impl Store for MemoryStore {
    async fn manifest_by_hash(&self, hash: &str) -> StoreResult<Option<Manifest>> {
        Ok(self
            .lock()
            .manifests
            .iter()
            .find(|m| m.manifest_hash == hash)
            .cloned())
    }

    async fn insert_manifest(&self, new: NewManifest) -> StoreResult<Manifest> {
        let mut t = self.lock();
        if !t.injected_manifest.is_empty() {
            match t.injected_manifest.remove(0) {
                InjectedConflict::RacingWriter => {
                    Self::insert_manifest_row(&mut t, new)?;
                    return Err(conflict("manifests.manifest_hash"));
                }
                InjectedConflict::Spurious => return Err(conflict("manifests.manifest_hash")),
            }
        }
        Self::insert_manifest_row(&mut t, new)
    }

    async fn manifest_reduced_by_hash(&self, hash: &str) -> StoreResult<Option<ManifestReduced>> {
        Ok(self.lock().reduced.iter().find(|m| m.hash == hash).cloned())
    }

    async fn insert_manifest_reduced(
        &self,
        new: NewManifestReduced,
    ) -> StoreResult<ManifestReduced> {
        let mut t = self.lock();
        if t.reduced.iter().any(|m| m.hash == new.hash) {
            return Err(conflict("manifest_reduced.hash"));
        }
        let row = ManifestReduced {
            id: t.next_id(),
            hash: new.hash,
        };
        t.reduced.push(row.clone());
        Ok(row)
    }

    async fn result(&self, id: i64) -> StoreResult<Option<BenchResult>> {
        Ok(self.lock().results.iter().find(|r| r.id == id).cloned())
    }

    async fn result_by_key(&self, name: &str, build_id: i64) -> StoreResult<Option<BenchResult>> {
        Ok(self
            .lock()
            .results
            .iter()
            .find(|r| r.name == name && r.build_id == build_id)
            .cloned())
    }

    async fn insert_result(&self, new: NewBenchResult) -> StoreResult<BenchResult> {
        let mut t = self.lock();
        t.result_insert_attempts += 1;
        if !t.injected.is_empty() {
            match t.injected.remove(0) {
                InjectedConflict::RacingWriter => {
                    Self::insert_result_row(&mut t, new)?;
                    return Err(conflict("results (name, build_id)"));
                }
                InjectedConflict::Spurious => return Err(conflict("results (name, build_id)")),
            }
        }
        Self::insert_result_row(&mut t, new)
    }

    async fn update_result(&self, id: i64, changes: ResultChanges) -> StoreResult<BenchResult> {
        let mut t = self.lock();
        let row = t
            .results
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("result {id}")))?;
        changes.apply(row);
        Ok(row.clone())
    }

    async fn set_annotation(&self, id: i64, annotation: Option<String>) -> StoreResult<()> {
        let mut t = self.lock();
        let row = t
            .results
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("result {id}")))?;
        row.annotation = annotation;
        Ok(())
    }

    async fn set_result_flags(&self, id: i64, completed: bool, reported: bool) -> StoreResult<()> {
        let mut t = self.lock();
        if let Some(row) = t.results.iter_mut().find(|r| r.id == id) {
            row.completed = completed;
            row.reported = reported;
        }
        Ok(())
    }

    async fn find_results(&self, filter: &ResultFilter) -> StoreResult<Vec<BenchResult>> {
        let t = self.lock();
        let manifest_ids: Option<Vec<i64>> = filter.manifest_hash.as_ref().map(|hash| {
            t.manifests
                .iter()
                .filter(|m| &m.manifest_hash == hash)
                .map(|m| m.id)
                .collect()
        });
        let mut rows: Vec<BenchResult> = t
            .results
            .iter()
            .filter(|r| filter.branch.as_ref().map_or(true, |b| &r.branch_name == b))
            .filter(|r| filter.name.as_ref().map_or(true, |n| &r.name == n))
            .filter(|r| {
                manifest_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&r.manifest_id))
            })
            .filter(|r| filter.created_from.map_or(true, |from| r.created_at >= from))
            .filter(|r| filter.created_before.map_or(true, |before| r.created_at < before))
            .filter(|r| filter.created_until.map_or(true, |until| r.created_at <= until))
            .filter(|r| !filter.exclude_gerrit || r.gerrit_change_number.is_none())
            .filter(|r| !filter.annotated_only || r.annotation.is_some())
            .filter(|r| !filter.unreported_only || !r.reported)
            .cloned()
            .collect();
        newest_first(&mut rows, |r| (r.created_at, r.id));
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn environment_by_identifier(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<Environment>> {
        Ok(self
            .lock()
            .environments
            .iter()
            .find(|e| e.identifier == identifier)
            .cloned())
    }

    async fn insert_environment(&self, new: NewEnvironment) -> StoreResult<Environment> {
        let mut t = self.lock();
        if t.environments.iter().any(|e| e.identifier == new.identifier) {
            return Err(conflict("environments.identifier"));
        }
        let row = Environment {
            id: t.next_id(),
            identifier: new.identifier,
            name: new.name,
        };
        t.environments.push(row.clone());
        Ok(row)
    }

    async fn environments(&self, ids: &[i64]) -> StoreResult<Vec<Environment>> {
        let mut rows: Vec<Environment> = self
            .lock()
            .environments
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(rows)
    }

    async fn benchmark_by_name(&self, name: &str) -> StoreResult<Option<Benchmark>> {
        Ok(self.lock().benchmarks.iter().find(|b| b.name == name).cloned())
    }

    async fn insert_benchmark(&self, new: NewBenchmark) -> StoreResult<Benchmark> {
        let mut t = self.lock();
        if t.benchmarks.iter().any(|b| b.name == new.name) {
            return Err(conflict("benchmarks.name"));
        }
        let row = Benchmark {
            id: t.next_id(),
            name: new.name,
        };
        t.benchmarks.push(row.clone());
        Ok(row)
    }

    async fn test_job(&self, id: &str) -> StoreResult<Option<TestJob>> {
        Ok(self.lock().test_jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn insert_test_job(&self, new: NewTestJob) -> StoreResult<TestJob> {
        let mut t = self.lock();
        if t.test_jobs.iter().any(|j| j.id == new.id) {
            return Err(conflict("test_jobs.id"));
        }
        let row = TestJob {
            id: new.id,
            result_id: new.result_id,
            status: new.status,
            initialized: new.initialized,
            completed: new.completed,
            resubmitted: false,
            environment_id: new.environment_id,
            data: new.data,
            data_filetype: new.data_filetype,
            runner_kind: new.runner_kind,
            runner_url: new.runner_url,
            url: None,
            definition: None,
            created_at: new.created_at,
        };
        t.test_jobs.push(row.clone());
        Ok(row)
    }

    async fn update_test_job(&self, id: &str, update: TestJobUpdate) -> StoreResult<TestJob> {
        let mut t = self.lock();
        let row = t
            .test_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("test job {id}")))?;
        update.apply(row);
        Ok(row.clone())
    }

    async fn set_resubmitted(&self, id: &str, value: bool) -> StoreResult<bool> {
        let mut t = self.lock();
        match t.test_jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.resubmitted != value => {
                job.resubmitted = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn test_jobs_for_result(&self, result_id: i64) -> StoreResult<Vec<TestJob>> {
        let mut rows: Vec<TestJob> = self
            .lock()
            .test_jobs
            .iter()
            .filter(|j| j.result_id == result_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn find_test_jobs(&self, filter: &TestJobFilter) -> StoreResult<Vec<TestJob>> {
        let t = self.lock();
        let mut rows: Vec<TestJob> = t
            .test_jobs
            .iter()
            .filter(|j| {
                filter.environment.as_ref().map_or(true, |ident| {
                    t.environments
                        .iter()
                        .any(|e| Some(e.id) == j.environment_id && &e.identifier == ident)
                })
            })
            .filter(|j| {
                let Some(result) = t.results.iter().find(|r| r.id == j.result_id) else {
                    return false;
                };
                filter.branch.as_ref().map_or(true, |b| &result.branch_name == b)
                    && (!filter.exclude_gerrit || result.gerrit_change_number.is_none())
            })
            .filter(|j| filter.completed.map_or(true, |c| j.completed == c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn complete_test_job(
        &self,
        id: &str,
        update: TestJobUpdate,
        rows: Vec<NewResultData>,
    ) -> StoreResult<bool> {
        let mut t = self.lock();
        let job = t
            .test_jobs
            .iter()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("test job {id}")))?;
        if job.completed {
            return Ok(false);
        }
        let now = Utc::now();
        for new in rows {
            let row_id = t.next_id();
            t.result_data.push(data_from_new(row_id, new, now));
        }
        if let Some(job) = t.test_jobs.iter_mut().find(|j| j.id == id) {
            update.apply(job);
        }
        Ok(true)
    }

    async fn find_result_data(&self, filter: &DataFilter) -> StoreResult<Vec<NamedResultData>> {
        let t = self.lock();
        let mut rows: Vec<NamedResultData> = t
            .result_data
            .iter()
            .filter(|d| {
                filter
                    .result_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&d.result_id))
            })
            .filter(|d| {
                filter.test_job_ids.as_ref().map_or(true, |ids| {
                    d.test_job_id.as_ref().is_some_and(|id| ids.contains(id))
                })
            })
            .filter(|d| filter.created_after.map_or(true, |after| d.created_at > after))
            .filter(|d| filter.created_before.map_or(true, |before| d.created_at < before))
            .filter_map(|d| {
                let bench = t.benchmarks.iter().find(|b| b.id == d.benchmark_id)?;
                Some(NamedResultData {
                    benchmark: bench.name.clone(),
                    data: d.clone(),
                })
            })
            .filter(|d| {
                filter
                    .benchmarks
                    .as_ref()
                    .map_or(true, |names| names.contains(&d.benchmark))
            })
            .collect();
        newest_first(&mut rows, |d| (d.data.created_at, d.data.id));
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, task: NewScheduledTask) -> StoreResult<i64> {
        let mut t = self.lock();
        let id = t.next_id();
        t.tasks.push(MemoryTask {
            id,
            kind: task.kind,
            payload: task.payload,
            not_before: task.not_before,
            status: task.status,
            attempts: 0,
            locked_at: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim_due(
        &self,
        _worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut t = self.lock();
        let mut due: Vec<&mut MemoryTask> = t
            .tasks
            .iter_mut()
            .filter(|task| {
                (task.status == TASK_PENDING && task.not_before <= now)
                    || (task.status == TASK_RUNNING
                        && task.locked_at.is_some_and(|at| at < stale_before))
            })
            .collect();
        due.sort_by(|a, b| a.not_before.cmp(&b.not_before).then(a.id.cmp(&b.id)));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|task| {
                task.status = TASK_RUNNING.to_string();
                task.locked_at = Some(now);
                task.attempts += 1;
                ClaimedTask {
                    id: task.id,
                    payload: task.payload.clone(),
                    attempts: task.attempts,
                }
            })
            .collect())
    }

    async fn complete(&self, id: i64) -> StoreResult<()> {
        let mut t = self.lock();
        if let Some(task) = t.tasks.iter_mut().find(|task| task.id == id) {
            task.status = TASK_DONE.to_string();
            task.locked_at = None;
        }
        Ok(())
    }

    async fn retry(&self, id: i64, not_before: DateTime<Utc>, error: &str) -> StoreResult<()> {
        let mut t = self.lock();
        if let Some(task) = t.tasks.iter_mut().find(|task| task.id == id) {
            task.status = TASK_PENDING.to_string();
            task.not_before = not_before;
            task.last_error = Some(error.to_string());
            task.locked_at = None;
        }
        Ok(())
    }

    async fn fail(&self, id: i64, error: &str) -> StoreResult<()> {
        let mut t = self.lock();
        if let Some(task) = t.tasks.iter_mut().find(|task| task.id == id) {
            task.status = TASK_FAILED.to_string();
            task.last_error = Some(error.to_string());
            task.locked_at = None;
        }
        Ok(())
    }
}
