//! Worker pool — background loop that claims due work items and runs them.
//!
//! At most `worker_concurrency` handlers run at once. A failed handler is put
//! back with a fixed backoff until `task_max_attempts`, then marked failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use tokio::sync::Semaphore;

use super::{enqueue, WorkItem};
use crate::models::task::ClaimedTask;
use crate::services::progress_service::{self, ProgressWindow};
use crate::services::{result_service, test_job_service, ServiceContext};

/// Delay before a failed task becomes due again.
const RETRY_BACKOFF_SECS: i64 = 30;

/// Digests run at this UTC hour.
const DIGEST_HOUR: i64 = 6;

/// Run the worker loop forever. Spawned as a background tokio task.
pub async fn run_worker(ctx: Arc<ServiceContext>) {
    let worker = format!("worker-{}", uuid::Uuid::new_v4());
    let permits = Arc::new(Semaphore::new(ctx.config.worker_concurrency));
    tracing::info!(
        worker = %worker,
        concurrency = ctx.config.worker_concurrency,
        "Task worker started"
    );

    loop {
        if let Err(e) = poll_once(&ctx, &worker, &permits).await {
            tracing::error!("Worker poll error: {e}");
        }
        tokio::time::sleep(Duration::from_secs(ctx.config.poll_interval_secs)).await;
    }
}

/// Claim as many due tasks as there are free permits and spawn a handler
/// for each. Returns the number of tasks claimed.
pub async fn poll_once(
    ctx: &Arc<ServiceContext>,
    worker: &str,
    permits: &Arc<Semaphore>,
) -> anyhow::Result<usize> {
    let free = permits.available_permits();
    if free == 0 {
        return Ok(0);
    }

    let now = Utc::now();
    let stale_before = now - chrono::Duration::seconds(ctx.config.task_visibility_secs as i64);
    let tasks = ctx
        .queue
        .claim_due(worker, now, stale_before, free as i64)
        .await?;
    let claimed = tasks.len();

    for task in tasks {
        let permit = permits.clone().acquire_owned().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = process_task(&ctx, task).await {
                tracing::error!("Task bookkeeping failed: {e}");
            }
            drop(permit);
        });
    }
    Ok(claimed)
}

/// Run one claimed task and record how it ended.
pub async fn process_task(ctx: &ServiceContext, task: ClaimedTask) -> anyhow::Result<()> {
    let started = Instant::now();
    let item: WorkItem = match serde_json::from_value(task.payload.clone()) {
        Ok(item) => item,
        Err(e) => {
            tracing::error!(task_id = task.id, error = %e, "Undecodable work item");
            ctx.queue
                .fail(task.id, &format!("undecodable payload: {e}"))
                .await?;
            crate::metrics::task_executed("unknown", "failed", elapsed_ms(started));
            return Ok(());
        }
    };

    let kind = item.kind();
    let outcome = match handle(ctx, &item).await {
        Ok(()) => {
            ctx.queue.complete(task.id).await?;
            "done"
        }
        Err(e) if task.attempts >= ctx.config.task_max_attempts => {
            tracing::error!(task_id = task.id, kind, attempts = task.attempts, error = %e, "Task failed permanently");
            ctx.queue.fail(task.id, &e.to_string()).await?;
            "failed"
        }
        Err(e) => {
            tracing::warn!(task_id = task.id, kind, attempts = task.attempts, error = %e, "Task failed, will retry");
            let not_before = Utc::now() + chrono::Duration::seconds(RETRY_BACKOFF_SECS);
            ctx.queue.retry(task.id, not_before, &e.to_string()).await?;
            "retried"
        }
    };
    crate::metrics::task_executed(kind, outcome, elapsed_ms(started));
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Dispatch a work item to its service.
pub async fn handle(ctx: &ServiceContext, item: &WorkItem) -> anyhow::Result<()> {
    match item {
        WorkItem::FetchTestJob { test_job_id } => {
            let outcome = test_job_service::fetch_results(ctx, test_job_id).await?;
            tracing::debug!(test_job = %test_job_id, ?outcome, "Fetch finished");
        }
        WorkItem::NotifyResult { result_id } => {
            result_service::notify_result(ctx, *result_id).await?;
        }
        WorkItem::CheckCompleteness => {
            test_job_service::check_completeness(ctx).await?;
        }
        WorkItem::ProgressDigest { window } => {
            progress_service::run_digest(ctx, *window, Utc::now()).await?;
        }
    }
    Ok(())
}

/// Queue a completeness sweep every `completeness_interval_secs`.
pub async fn run_completeness_ticker(ctx: Arc<ServiceContext>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(ctx.config.completeness_interval_secs));
    loop {
        interval.tick().await;
        if let Err(e) = enqueue(ctx.queue.as_ref(), &WorkItem::CheckCompleteness, Utc::now()).await {
            tracing::error!("Failed to queue completeness sweep: {e}");
        }
    }
}

/// Queue a progress digest for `window` at each of its scheduled times.
pub async fn run_digest_ticker(ctx: Arc<ServiceContext>, window: ProgressWindow) {
    loop {
        let now = Utc::now();
        let next = next_run(window, now);
        tracing::info!(window = window.as_str(), %next, "Next progress digest scheduled");
        tokio::time::sleep((next - now).to_std().unwrap_or(Duration::ZERO)).await;

        if let Err(e) = enqueue(ctx.queue.as_ref(), &WorkItem::ProgressDigest { window }, next).await {
            tracing::error!(window = window.as_str(), "Failed to queue progress digest: {e}");
        }
    }
}

/// The first digest time strictly after `now`: Mondays for the weekly
/// window, the 1st of the month for the monthly one, at 06:00 UTC.
pub fn next_run(window: ProgressWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let at_hour = |date: NaiveDate| {
        date.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::hours(DIGEST_HOUR)
    };
    let today = now.date_naive();
    match window {
        ProgressWindow::Weekly => {
            let ahead = (7 - today.weekday().num_days_from_monday()) % 7;
            let candidate = at_hour(today + chrono::Duration::days(ahead as i64));
            if candidate > now {
                candidate
            } else {
                candidate + chrono::Duration::days(7)
            }
        }
        ProgressWindow::Monthly => {
            let first = today - chrono::Duration::days(today.day0() as i64);
            let candidate = at_hour(first);
            if candidate > now {
                candidate
            } else {
                at_hour(
                    first
                        .checked_add_months(Months::new(1))
                        .unwrap_or(NaiveDate::MAX),
                )
            }
        }
    }
}
