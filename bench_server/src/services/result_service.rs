//! Result lookups: baseline selection, annotations and completion reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::models::result::BenchResult;
use crate::services::gerrit_service::review_message;
use crate::services::progress_service;
use crate::services::ServiceContext;
use crate::store::{ResultFilter, Store};

/// The implicit baseline of `result`: the latest earlier result on the same
/// branch. Unless `ignore_gerrit` is set, pre-merge builds never qualify.
pub async fn to_compare<S: Store + ?Sized>(
    store: &S,
    result: &BenchResult,
    ignore_gerrit: bool,
) -> StoreResult<Option<BenchResult>> {
    let candidates = store
        .find_results(&ResultFilter {
            branch: Some(result.branch_name.clone()),
            created_before: Some(result.created_at),
            exclude_gerrit: !ignore_gerrit,
            limit: Some(1),
            ..Default::default()
        })
        .await?;
    Ok(candidates.into_iter().next())
}

/// An explicitly requested baseline must exist; otherwise fall back to
/// [`to_compare`].
pub async fn resolve_baseline<S: Store + ?Sized>(
    store: &S,
    result: &BenchResult,
    explicit: Option<i64>,
    ignore_gerrit: bool,
) -> StoreResult<Option<BenchResult>> {
    match explicit {
        Some(id) => store
            .result(id)
            .await?
            .map(Some)
            .ok_or_else(|| StoreError::NotFound(format!("result {id}"))),
        None => to_compare(store, result, ignore_gerrit).await,
    }
}

pub async fn get_result<S: Store + ?Sized>(store: &S, id: i64) -> StoreResult<BenchResult> {
    store
        .result(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("result {id}")))
}

pub async fn save_annotation<S: Store + ?Sized>(
    store: &S,
    id: i64,
    annotation: Option<String>,
) -> StoreResult<()> {
    let annotation = annotation.filter(|a| !a.trim().is_empty());
    store.set_annotation(id, annotation).await?;
    tracing::info!(result_id = id, "Annotation saved");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationPoint {
    pub date: DateTime<Utc>,
    pub label: String,
}

/// Annotated results, newest first, for chart markers.
pub async fn annotations<S: Store + ?Sized>(
    store: &S,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<i64>,
) -> StoreResult<Vec<AnnotationPoint>> {
    let rows = store
        .find_results(&ResultFilter {
            annotated_only: true,
            created_from: if limit.is_some() { None } else { start },
            created_before: if limit.is_some() { None } else { end },
            limit,
            ..Default::default()
        })
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| {
            Some(AnnotationPoint {
                date: r.created_at,
                label: r.annotation?,
            })
        })
        .collect())
}

/// Mark the result completed once every test job is, then report it once.
///
/// Pre-merge builds get a Gerrit review summarizing regressions against the
/// implicit baseline. Safe to run repeatedly.
pub async fn notify_result(ctx: &ServiceContext, result_id: i64) -> anyhow::Result<()> {
    let store = ctx.store.as_ref();
    let Some(result) = store.result(result_id).await? else {
        tracing::warn!(result_id, "Result vanished before notification");
        return Ok(());
    };
    if result.reported {
        return Ok(());
    }

    let jobs = store.test_jobs_for_result(result_id).await?;
    if jobs.is_empty() || jobs.iter().any(|j| !j.completed) {
        tracing::debug!(result_id, jobs = jobs.len(), "Result not complete yet");
        return Ok(());
    }

    if result.is_gerrit_build() {
        let baseline = to_compare(store, &result, ctx.config.ignore_gerrit).await?;
        let regressions = match &baseline {
            Some(base) => {
                let envs = progress_service::progress_between_results(store, &result, base).await?;
                Some(
                    envs.iter()
                        .map(|e| crate::comparison::regressions(&e.changes))
                        .sum::<usize>(),
                )
            }
            None => None,
        };
        let message = review_message(
            &result,
            &jobs,
            baseline.as_ref().zip(regressions),
            &ctx.config.dashboard_url,
        );
        ctx.reviews.post_review(&result, &message).await?;
    }

    store.set_result_flags(result_id, true, true).await?;
    tracing::info!(result_id, name = %result.name, "Result complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_job::NewTestJob;
    use crate::services::testing::{at, harness, new_result};
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_to_compare_picks_latest_earlier_baseline() {
        let store = MemoryStore::new();
        let old = store.seed_result(new_result("build", 1, "master", None), at("2024-01-01T00:00:00Z"));
        let newer = store.seed_result(new_result("build", 2, "master", None), at("2024-01-02T00:00:00Z"));
        store.seed_result(new_result("build", 3, "master", Some("555")), at("2024-01-03T00:00:00Z"));
        store.seed_result(new_result("build", 4, "other", None), at("2024-01-03T12:00:00Z"));
        let current = store.seed_result(new_result("build", 5, "master", None), at("2024-01-04T00:00:00Z"));

        let base = to_compare(&store, &current, false).await.unwrap().unwrap();
        assert_eq!(base.id, newer.id);

        let base = to_compare(&store, &newer, false).await.unwrap().unwrap();
        assert_eq!(base.id, old.id);

        assert!(to_compare(&store, &old, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ignore_gerrit_admits_pre_merge_builds() {
        let store = MemoryStore::new();
        store.seed_result(new_result("build", 1, "master", None), at("2024-01-01T00:00:00Z"));
        let gerrit = store.seed_result(new_result("build", 2, "master", Some("555")), at("2024-01-02T00:00:00Z"));
        let current = store.seed_result(new_result("build", 3, "master", None), at("2024-01-03T00:00:00Z"));

        let base = to_compare(&store, &current, true).await.unwrap().unwrap();
        assert_eq!(base.id, gerrit.id);
    }

    #[tokio::test]
    async fn test_single_result_branch_has_no_baseline() {
        let store = MemoryStore::new();
        let only = store.seed_result(new_result("build", 1, "lonely", None), at("2024-01-01T00:00:00Z"));
        assert!(to_compare(&store, &only, false).await.unwrap().is_none());
        assert!(resolve_baseline(&store, &only, None, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_baseline_must_exist() {
        let store = MemoryStore::new();
        let a = store.seed_result(new_result("build", 1, "master", None), at("2024-01-01T00:00:00Z"));
        let b = store.seed_result(new_result("build", 2, "other", None), at("2024-01-02T00:00:00Z"));

        let base = resolve_baseline(&store, &b, Some(a.id), false).await.unwrap();
        assert_eq!(base.map(|r| r.id), Some(a.id));
        assert!(matches!(
            resolve_baseline(&store, &b, Some(999), false).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_annotations() {
        let store = MemoryStore::new();
        let a = store.seed_result(new_result("build", 1, "master", None), at("2024-01-01T00:00:00Z"));
        store.seed_result(new_result("build", 2, "master", None), at("2024-01-02T00:00:00Z"));
        save_annotation(&store, a.id, Some("toolchain bump".to_string())).await.unwrap();

        let points = annotations(&store, None, None, None).await.unwrap();
        assert_eq!(
            points,
            vec![AnnotationPoint {
                date: at("2024-01-01T00:00:00Z"),
                label: "toolchain bump".to_string()
            }]
        );
        assert!(matches!(
            save_annotation(&store, 999, None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_notify_waits_for_jobs_then_reports_once() {
        let h = harness();
        let result = h.store.seed_result(new_result("build", 1, "master", Some("4194")), Utc::now());
        h.ctx
            .store
            .insert_test_job(NewTestJob::pending("100", result.id, "GenericLavaTestSystem", "https://lava.example.org/"))
            .await
            .unwrap();

        notify_result(&h.ctx, result.id).await.unwrap();
        assert!(!h.ctx.store.result(result.id).await.unwrap().unwrap().completed);
        assert!(h.notifier.posted.lock().unwrap().is_empty());

        let job = h.ctx.store.test_job("100").await.unwrap().unwrap();
        let mut update = crate::models::test_job::TestJobUpdate::from_job(&job);
        update.completed = true;
        h.ctx.store.update_test_job("100", update).await.unwrap();

        notify_result(&h.ctx, result.id).await.unwrap();
        notify_result(&h.ctx, result.id).await.unwrap();

        let stored = h.ctx.store.result(result.id).await.unwrap().unwrap();
        assert!(stored.completed && stored.reported);
        let posted = h.notifier.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.contains("No baseline"));
    }
}
