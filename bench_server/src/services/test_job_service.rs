//! Test job polling, result storage and resubmission.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{IngestError, StoreError, StoreResult};
use crate::events::test_job::{TestJobAggregate, TestJobEvent};
use crate::models::result_data::NewResultData;
use crate::models::test_job::{NewTestJob, TestJob, TestJobStatus};
use crate::scheduler::{enqueue, WorkItem};
use crate::services::ServiceContext;
use crate::store::{benchmark, environment, ResultFilter, Store, TestJobFilter};
use crate::testrunner::{RunnerKind, TestJobResult};

/// What a fetch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The job was already completed; nothing was touched.
    AlreadyCompleted,
    /// The runner has not finished the job yet.
    Pending(TestJobStatus),
    /// The job finished without measurements.
    ResultsMissing,
    /// Measurements were stored.
    Stored { rows: usize },
}

/// Outcome of a resubmission request; both carry the result's test jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum ResubmitOutcome {
    Accepted(Vec<TestJob>),
    Rejected(Vec<TestJob>),
}

/// Group each benchmark's measurements by subscore name into result data rows.
pub async fn build_result_rows<S: Store + ?Sized>(
    store: &S,
    job: &TestJob,
    results: &[TestJobResult],
) -> StoreResult<Vec<NewResultData>> {
    let mut rows = Vec::new();
    for result in results {
        let bench = benchmark(store, &result.benchmark_name).await?;

        let mut by_subscore: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for m in &result.subscore {
            by_subscore.entry(m.name.as_str()).or_default().push(m.measurement);
        }
        rows.extend(by_subscore.into_iter().map(|(name, values)| NewResultData {
            benchmark_id: bench.id,
            result_id: job.result_id,
            test_job_id: Some(job.id.clone()),
            name: name.to_string(),
            values,
            board: result.board.clone(),
        }));
    }
    Ok(rows)
}

/// Poll a test job and, once it has finished, store its results.
///
/// A completed job is never fetched again.
pub async fn fetch_results(ctx: &ServiceContext, id: &str) -> Result<FetchOutcome, IngestError> {
    let store = ctx.store.as_ref();
    let job = store
        .test_job(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("test job {id}")))?;
    if job.completed {
        tracing::debug!(test_job = %id, "Test job already completed, skipping fetch");
        return Ok(FetchOutcome::AlreadyCompleted);
    }

    let mut agg = TestJobAggregate::from_job(&job);
    let kind: RunnerKind = job.runner_kind.parse()?;
    let mut runner = ctx.runners.runner(kind, &job.runner_url)?;

    let status = runner.get_test_job_status(id).await?;
    agg.apply(&TestJobEvent::StatusPolled {
        status,
        url: runner.get_job_url(id),
    });

    if !agg.initialized {
        let resolved = runner.get_result_class_name(id).await?;
        agg.apply(&TestJobEvent::RunnerResolved {
            runner_kind: resolved.tag().to_string(),
        });
        store.update_test_job(id, agg.to_update()).await?;
        runner = ctx.runners.runner(resolved, &job.runner_url)?;
    }

    if status != job.status() {
        crate::metrics::test_job_status_changed(status.as_str());
    }

    if !status.is_finished() {
        store.update_test_job(id, agg.to_update()).await?;
        tracing::debug!(test_job = %id, %status, "Test job not finished");
        return Ok(FetchOutcome::Pending(status));
    }

    let definition = runner.get_test_job_details(id).await?.definition;
    let results = runner.get_test_job_results(id).await?;

    if results.is_empty() {
        agg.apply(&TestJobEvent::ResultsMissing { definition });
        store.complete_test_job(id, agg.to_update(), Vec::new()).await?;
        crate::metrics::test_job_status_changed(TestJobStatus::ResultsMissing.as_str());
        tracing::warn!(test_job = %id, "Test job finished without results");
        return Ok(FetchOutcome::ResultsMissing);
    }

    if job.environment_id.is_none() {
        if let Some(board) = results.iter().map(|r| r.board.trim()).find(|b| !b.is_empty()) {
            let env = environment(store, board).await?;
            agg.apply(&TestJobEvent::EnvironmentResolved {
                environment_id: env.id,
            });
        }
    }

    let data = runner.get_result_data(id).await?;
    let rows = build_result_rows(store, &job, &results).await?;
    let count = rows.len();
    agg.apply(&TestJobEvent::ResultsStored {
        definition,
        rows: count,
        data,
    });

    if !store.complete_test_job(id, agg.to_update(), rows).await? {
        tracing::info!(test_job = %id, "Test job completed concurrently");
        return Ok(FetchOutcome::AlreadyCompleted);
    }
    if let Err(e) = runner.cleanup().await {
        tracing::warn!(test_job = %id, error = %e, "Runner cleanup failed");
    }
    enqueue(
        ctx.queue.as_ref(),
        &WorkItem::NotifyResult {
            result_id: job.result_id,
        },
        Utc::now(),
    )
    .await?;

    tracing::info!(test_job = %id, result_id = job.result_id, rows = count, "Test job results stored");
    Ok(FetchOutcome::Stored { rows: count })
}

/// Ask the runner to run a failed job again.
///
/// Refused while the job is unpolled, queued, running or complete, and for a
/// job that was already resubmitted.
pub async fn resubmit(ctx: &ServiceContext, id: &str) -> Result<ResubmitOutcome, IngestError> {
    let store = ctx.store.as_ref();
    let job = store
        .test_job(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("test job {id}")))?;

    if job.resubmitted || !job.status().allows_resubmit() {
        tracing::info!(test_job = %id, status = %job.status(), resubmitted = job.resubmitted, "Resubmit rejected");
        return rejected(store, job.result_id).await;
    }

    let kind: RunnerKind = job.runner_kind.parse()?;
    let runner = ctx.runners.runner(kind, &job.runner_url)?;

    // Claim the latch before calling out so concurrent requests resubmit once.
    if !store.set_resubmitted(id, true).await? {
        tracing::info!(test_job = %id, "Resubmit already claimed");
        return rejected(store, job.result_id).await;
    }
    let new_ids = match runner.resubmit(id).await {
        Ok(ids) => ids,
        Err(e) => {
            store.set_resubmitted(id, false).await?;
            return Err(e.into());
        }
    };

    for new_id in &new_ids {
        let mut new = NewTestJob::pending(
            new_id.clone(),
            job.result_id,
            runner.kind().tag(),
            job.runner_url.clone(),
        );
        new.environment_id = job.environment_id;
        match store.insert_test_job(new).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(test_job = %new_id, "Resubmitted job id already known");
            }
            Err(e) => return Err(e.into()),
        }
        enqueue(
            ctx.queue.as_ref(),
            &WorkItem::FetchTestJob {
                test_job_id: new_id.clone(),
            },
            Utc::now(),
        )
        .await?;
    }

    tracing::info!(test_job = %id, new_ids = ?new_ids, "Test job resubmitted");
    let siblings = store.test_jobs_for_result(job.result_id).await?;
    Ok(ResubmitOutcome::Accepted(siblings))
}

async fn rejected<S: Store + ?Sized>(
    store: &S,
    result_id: i64,
) -> Result<ResubmitOutcome, IngestError> {
    let siblings = store.test_jobs_for_result(result_id).await?;
    Ok(ResubmitOutcome::Rejected(siblings))
}

/// Queue a fetch for every test job that has not completed yet, and a
/// notification for finished results that were never reported.
pub async fn check_completeness(ctx: &ServiceContext) -> anyhow::Result<usize> {
    let store = ctx.store.as_ref();
    let pending = store
        .find_test_jobs(&TestJobFilter {
            completed: Some(false),
            ..Default::default()
        })
        .await?;
    tracing::info!(count = pending.len(), "Fetch incomplete test job results");

    let now = Utc::now();
    for job in &pending {
        enqueue(
            ctx.queue.as_ref(),
            &WorkItem::FetchTestJob {
                test_job_id: job.id.clone(),
            },
            now,
        )
        .await?;
    }

    let unreported = store
        .find_results(&ResultFilter {
            unreported_only: true,
            ..Default::default()
        })
        .await?;
    let mut notified = 0;
    for result in &unreported {
        let jobs = store.test_jobs_for_result(result.id).await?;
        if jobs.is_empty() || jobs.iter().any(|j| !j.completed) {
            continue;
        }
        enqueue(
            ctx.queue.as_ref(),
            &WorkItem::NotifyResult {
                result_id: result.id,
            },
            now,
        )
        .await?;
        notified += 1;
    }
    if notified > 0 {
        tracing::info!(count = notified, "Re-queued unreported results");
    }
    Ok(pending.len() + notified)
}
