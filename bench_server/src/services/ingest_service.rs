//! Result submission: validate, reconcile under conflict retry, queue follow-ups.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, StoreResult};
use crate::models::result::{BenchResult, NewBenchResult, ResultChanges};
use crate::models::test_job::{NewTestJob, TestJob, TestJobStatus, TestJobUpdate};
use crate::retry::retry_on_conflict;
use crate::scheduler::{enqueue, WorkItem};
use crate::services::manifest_service::get_or_create_manifest;
use crate::services::test_job_service::build_result_rows;
use crate::services::ServiceContext;
use crate::store::{environment, get_or_create, Store};
use crate::testrunner::jenkins::parse_test_results;
use crate::testrunner::{RunnerKind, TestJobResult};

/// A file field from a multipart submission.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub field_name: String,
    pub bytes: Vec<u8>,
}

/// One CI build's submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSubmission {
    pub name: String,
    pub build_id: i64,
    #[serde(default)]
    pub build_number: i64,
    pub build_url: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub gerrit_change_number: Option<String>,
    #[serde(default)]
    pub gerrit_patchset_number: Option<String>,
    #[serde(default)]
    pub gerrit_change_id: Option<String>,
    #[serde(default)]
    pub gerrit_change_url: Option<String>,
    pub manifest: String,
    /// Comma-separated remote test job ids.
    #[serde(default)]
    pub test_jobs: Option<String>,
    #[serde(skip)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub result: BenchResult,
    pub created: bool,
    pub test_jobs: Vec<TestJob>,
    pub follow_ups: usize,
}

/// A `.json` file field, already parsed.
struct DirectPayload {
    environment: String,
    bytes: Vec<u8>,
    results: Vec<TestJobResult>,
}

/// Split a comma-separated id list: trimmed, non-empty, first occurrence wins.
pub fn parse_test_job_ids(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

fn validate(submission: &ResultSubmission) -> Result<Vec<DirectPayload>, IngestError> {
    if submission.name.trim().is_empty() {
        return Err(IngestError::Validation("name is required".to_string()));
    }
    if submission.build_id < 0 {
        return Err(IngestError::Validation(format!(
            "build_id must not be negative, got {}",
            submission.build_id
        )));
    }
    let url = reqwest::Url::parse(&submission.build_url).map_err(|e| {
        IngestError::Validation(format!("build_url {:?} is not a URL: {e}", submission.build_url))
    })?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(IngestError::Validation(format!(
            "build_url {:?} is not an absolute URL",
            submission.build_url
        )));
    }
    if submission.manifest.trim().is_empty() {
        return Err(IngestError::Validation("manifest is required".to_string()));
    }

    submission
        .files
        .iter()
        .filter_map(|file| {
            let env = file.field_name.strip_suffix(".json")?;
            Some((env, file))
        })
        .map(|(env, file)| {
            let results = parse_test_results(&file.bytes)
                .map_err(|e| IngestError::Validation(format!("{}: {e}", file.field_name)))?;
            Ok(DirectPayload {
                environment: env.to_string(),
                bytes: file.bytes.clone(),
                results,
            })
        })
        .collect()
}

/// `{scheme}://{host}/job/{name}/{build_number}/` from the build URL.
fn jenkins_job_url(submission: &ResultSubmission) -> Result<String, IngestError> {
    let url = reqwest::Url::parse(&submission.build_url)
        .map_err(|e| IngestError::Validation(e.to_string()))?;
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!(
        "{}://{authority}/job/{}/{}/",
        url.scheme(),
        submission.name,
        submission.build_number
    ))
}

async fn upsert_result<S: Store + ?Sized>(
    store: &S,
    new: NewBenchResult,
) -> StoreResult<(BenchResult, bool)> {
    match store.result_by_key(&new.name, new.build_id).await? {
        Some(existing) => {
            let updated = store
                .update_result(existing.id, ResultChanges::from_new(&new))
                .await?;
            Ok((updated, false))
        }
        None => Ok((store.insert_result(new).await?, true)),
    }
}

async fn store_direct_payload(
    ctx: &ServiceContext,
    result: &BenchResult,
    runner_url: &str,
    payload: &DirectPayload,
) -> Result<(), IngestError> {
    let store = ctx.store.as_ref();
    let env = environment(store, &payload.environment).await?;
    let job_id = format!("J{}_{}_{}", result.build_id, result.name, env.identifier);

    let (job, _) = get_or_create(
        || store.test_job(&job_id),
        || {
            store.insert_test_job(NewTestJob {
                id: job_id.clone(),
                result_id: result.id,
                status: TestJobStatus::Complete.as_str().to_string(),
                initialized: true,
                completed: false,
                environment_id: Some(env.id),
                data: Some(payload.bytes.clone()),
                data_filetype: Some("json".to_string()),
                runner_kind: RunnerKind::ArtJenkins.tag().to_string(),
                runner_url: runner_url.to_string(),
                created_at: result.created_at,
            })
        },
    )
    .await?;
    if job.completed {
        tracing::debug!(test_job = %job.id, "Direct payload already stored");
        return Ok(());
    }

    let rows = build_result_rows(store, &job, &payload.results).await?;
    let count = rows.len();
    let mut update = TestJobUpdate::from_job(&job);
    update.completed = true;
    update.url = Some(runner_url.to_string());
    if store.complete_test_job(&job.id, update, rows).await? {
        tracing::info!(test_job = %job.id, environment = %env.identifier, rows = count, "Direct payload stored");
    }
    Ok(())
}

/// One reconciliation pass. A `Conflict` anywhere aborts the pass so the
/// retry loop can re-read.
async fn reconcile(
    ctx: &ServiceContext,
    submission: &ResultSubmission,
    payloads: &[DirectPayload],
    attempt: u32,
) -> Result<(BenchResult, bool, Vec<WorkItem>), IngestError> {
    let store = ctx.store.as_ref();
    let manifest = get_or_create_manifest(store, &submission.manifest).await?;

    let (result, created) = upsert_result(
        store,
        NewBenchResult {
            name: submission.name.clone(),
            build_id: submission.build_id,
            build_number: submission.build_number,
            build_url: submission.build_url.clone(),
            branch_name: submission.branch_name.clone(),
            gerrit_change_number: submission.gerrit_change_number.clone(),
            gerrit_patchset_number: submission.gerrit_patchset_number.clone(),
            gerrit_change_id: submission.gerrit_change_id.clone(),
            gerrit_change_url: submission.gerrit_change_url.clone(),
            manifest_id: manifest.id,
            created_at: Utc::now(),
        },
    )
    .await?;
    tracing::debug!(result_id = result.id, attempt, created, "Result reconciled");

    let mut follow_ups = Vec::new();
    let ids = submission
        .test_jobs
        .as_deref()
        .map(parse_test_job_ids)
        .unwrap_or_default();

    if !ids.is_empty() {
        let kind = RunnerKind::Lava.tag();
        for id in ids {
            let (_, job_created) = get_or_create(
                || store.test_job(&id),
                || {
                    store.insert_test_job(NewTestJob::pending(
                        id.clone(),
                        result.id,
                        kind,
                        ctx.config.default_runner_url.clone(),
                    ))
                },
            )
            .await?;
            if job_created {
                follow_ups.push(WorkItem::FetchTestJob { test_job_id: id });
            }
        }
        follow_ups.push(WorkItem::NotifyResult {
            result_id: result.id,
        });
    } else if !payloads.is_empty() {
        let runner_url = jenkins_job_url(submission)?;
        for payload in payloads {
            store_direct_payload(ctx, &result, &runner_url, payload).await?;
        }
        follow_ups.push(WorkItem::NotifyResult {
            result_id: result.id,
        });
    }

    Ok((result, created, follow_ups))
}

/// Record a build's results. Repeating a submission updates the existing
/// result rather than creating another.
pub async fn submit_result(
    ctx: &ServiceContext,
    submission: ResultSubmission,
) -> Result<IngestReceipt, IngestError> {
    let payloads = validate(&submission)?;

    let submission = &submission;
    let payloads = payloads.as_slice();
    let (result, created, items) = retry_on_conflict(ctx.config.retry_policy(), move |attempt| {
        reconcile(ctx, submission, payloads, attempt)
    })
    .await?;

    let not_before = Utc::now() + ctx.config.follow_up_delay();
    for item in &items {
        enqueue(ctx.queue.as_ref(), item, not_before).await?;
    }
    crate::metrics::result_ingested(created);

    let test_jobs = ctx.store.test_jobs_for_result(result.id).await?;
    tracing::info!(
        result_id = result.id,
        name = %result.name,
        build_id = result.build_id,
        created,
        test_jobs = test_jobs.len(),
        follow_ups = items.len(),
        "Result submitted"
    );
    Ok(IngestReceipt {
        result,
        created,
        test_jobs,
        follow_ups: items.len(),
    })
}
