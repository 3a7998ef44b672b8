//! Deferred work: a durable queue of [`WorkItem`]s drained by a worker pool.
//!
//! Items are stored as JSON with a not-before time. Workers claim due rows,
//! run the handler and mark the row done; a claimed row whose worker vanished
//! becomes claimable again after the visibility timeout, so every handler
//! must tolerate running twice.

pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::models::task::{ClaimedTask, NewScheduledTask, TASK_PENDING};
use crate::services::progress_service::ProgressWindow;

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// Poll a test job and store its results once it finishes.
    FetchTestJob { test_job_id: String },
    /// Re-evaluate a result's completeness and report it.
    NotifyResult { result_id: i64 },
    /// Re-enqueue fetches for every unfinished test job.
    CheckCompleteness,
    /// Compare the latest results against the start of a window.
    ProgressDigest { window: ProgressWindow },
}

impl WorkItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchTestJob { .. } => "fetch_test_job",
            Self::NotifyResult { .. } => "notify_result",
            Self::CheckCompleteness => "check_completeness",
            Self::ProgressDigest { .. } => "progress_digest",
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewScheduledTask) -> StoreResult<i64>;

    /// Claim up to `limit` due tasks: pending ones whose time has come and
    /// running ones locked before `stale_before`.
    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ClaimedTask>>;

    async fn complete(&self, id: i64) -> StoreResult<()>;

    /// Put a task back as pending, due at `not_before`.
    async fn retry(&self, id: i64, not_before: DateTime<Utc>, error: &str) -> StoreResult<()>;

    async fn fail(&self, id: i64, error: &str) -> StoreResult<()>;
}

/// Serialize `item` and queue it.
pub async fn enqueue<Q: TaskQueue + ?Sized>(
    queue: &Q,
    item: &WorkItem,
    not_before: DateTime<Utc>,
) -> StoreResult<i64> {
    let payload = serde_json::to_value(item)?;
    let id = queue
        .enqueue(NewScheduledTask {
            kind: item.kind().to_string(),
            payload,
            not_before,
            status: TASK_PENDING.to_string(),
        })
        .await?;
    tracing::debug!(task_id = id, kind = item.kind(), %not_before, "Work item queued");
    Ok(id)
}
