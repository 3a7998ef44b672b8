//! Geomean "Summary" series for a branch and environment.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreResult;
use crate::models::result_data::NamedResultData;
use crate::stats::geomean;
use crate::store::{DataFilter, Store, TestJobFilter};

/// Summary series request. Without a limit, `start`/`end` bound the
/// measurement times exclusively; with one, the latest `limit` results win.
#[derive(Debug, Clone, Default)]
pub struct SummaryQuery {
    pub branch: Option<String>,
    pub environment: Option<String>,
    pub benchmarks: Vec<String>,
    pub limit: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryPoint {
    pub result: i64,
    pub created_at: DateTime<Utc>,
    pub measurement: f64,
    pub name: &'static str,
}

/// One point per result: the geomean of every measurement of the requested
/// benchmarks, newest result first.
pub async fn benchmark_summary<S: Store + ?Sized>(
    store: &S,
    query: &SummaryQuery,
    ignore_gerrit: bool,
) -> StoreResult<Vec<SummaryPoint>> {
    let (Some(branch), Some(environment)) = (&query.branch, &query.environment) else {
        return Ok(Vec::new());
    };
    if query.benchmarks.is_empty() {
        return Ok(Vec::new());
    }

    let jobs = store
        .find_test_jobs(&TestJobFilter {
            environment: Some(environment.clone()),
            branch: Some(branch.clone()),
            exclude_gerrit: !ignore_gerrit,
            completed: None,
        })
        .await?;
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let limit = query.limit.filter(|n| *n > 0);
    let (created_after, created_before) = match (limit, query.start) {
        (None, Some(start)) => (Some(start), query.end),
        _ => (None, None),
    };
    let rows = store
        .find_result_data(&DataFilter {
            test_job_ids: Some(jobs.into_iter().map(|j| j.id).collect()),
            benchmarks: Some(query.benchmarks.clone()),
            created_after,
            created_before,
            limit: limit.map(|n| n * query.benchmarks.len() as i64),
            ..Default::default()
        })
        .await?;

    Ok(summarize(&rows))
}

/// Fold consecutive rows of the same result into one geomean point.
fn summarize(rows: &[NamedResultData]) -> Vec<SummaryPoint> {
    rows.chunk_by(|a, b| a.data.result_id == b.data.result_id)
        .filter_map(|group| {
            let last = group.last()?;
            let values: Vec<f64> = group
                .iter()
                .flat_map(|r| r.data.values.iter().copied())
                .collect();
            match geomean(&values) {
                Ok(measurement) => Some(SummaryPoint {
                    result: last.data.result_id,
                    created_at: last.data.created_at,
                    measurement,
                    name: "Summary",
                }),
                Err(e) => {
                    tracing::warn!(result_id = last.data.result_id, error = %e, "Skipping summary point");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::environment::NewEnvironment;
    use crate::models::result_data::NewResultData;
    use crate::models::test_job::NewTestJob;
    use crate::services::testing::{at, new_result};
    use crate::store::memory::MemoryStore;
    use crate::store::{benchmark, environment};

    struct Fixture {
        store: MemoryStore,
        results: Vec<i64>,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let env = environment(&store, "juno").await.unwrap();
        store
            .insert_environment(NewEnvironment {
                identifier: "hikey".to_string(),
                name: "hikey".to_string(),
            })
            .await
            .unwrap();
        let cpu = benchmark(&store, "cpu").await.unwrap();
        let mem = benchmark(&store, "memory").await.unwrap();

        let mut results = Vec::new();
        for (i, day) in ["2024-01-01", "2024-01-02", "2024-01-03"].iter().enumerate() {
            let when = at(&format!("{day}T00:00:00Z"));
            let gerrit = if i == 2 { Some("77") } else { None };
            let r = store.seed_result(new_result("build", i as i64, "master", gerrit), when);
            let mut job = NewTestJob::pending(format!("job{i}"), r.id, "GenericLavaTestSystem", "https://lava.example.org/");
            job.environment_id = Some(env.id);
            store.insert_test_job(job).await.unwrap();

            for (bench, values) in [(cpu.id, vec![2.0, 8.0]), (mem.id, vec![4.0])] {
                store.seed_result_data(
                    NewResultData {
                        benchmark_id: bench,
                        result_id: r.id,
                        test_job_id: Some(format!("job{i}")),
                        name: "score".to_string(),
                        values,
                        board: "juno".to_string(),
                    },
                    when,
                );
            }
            results.push(r.id);
        }
        Fixture { store, results }
    }

    fn query(limit: Option<i64>) -> SummaryQuery {
        SummaryQuery {
            branch: Some("master".to_string()),
            environment: Some("juno".to_string()),
            benchmarks: vec!["cpu".to_string(), "memory".to_string()],
            limit,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_summary_is_geomean_per_result() {
        let f = fixture().await;
        let points = benchmark_summary(&f.store, &query(None), false).await.unwrap();

        // The Gerrit build is left out; newest first.
        assert_eq!(
            points.iter().map(|p| p.result).collect::<Vec<_>>(),
            vec![f.results[1], f.results[0]]
        );
        for p in &points {
            // geomean(2, 8, 4) == 4
            assert!((p.measurement - 4.0).abs() < 1e-9);
            assert_eq!(p.name, "Summary");
        }
        assert_eq!(points[0].created_at, at("2024-01-02T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_ignore_gerrit_and_limit() {
        let f = fixture().await;
        let points = benchmark_summary(&f.store, &query(Some(1)), true).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].result, f.results[2]);
    }

    #[tokio::test]
    async fn test_missing_parameters_yield_nothing() {
        let f = fixture().await;
        let mut q = query(None);
        q.environment = None;
        assert!(benchmark_summary(&f.store, &q, false).await.unwrap().is_empty());

        let mut q = query(None);
        q.benchmarks.clear();
        assert!(benchmark_summary(&f.store, &q, false).await.unwrap().is_empty());

        let mut q = query(None);
        q.environment = Some("hikey".to_string());
        assert!(benchmark_summary(&f.store, &q, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_date_range_applies_without_limit() {
        let f = fixture().await;
        let mut q = query(None);
        q.start = Some(at("2024-01-01T00:00:00Z"));
        let points = benchmark_summary(&f.store, &q, false).await.unwrap();
        assert_eq!(points.iter().map(|p| p.result).collect::<Vec<_>>(), vec![f.results[1]]);

        // A limit overrides the range.
        q.limit = Some(5);
        assert_eq!(benchmark_summary(&f.store, &q, false).await.unwrap().len(), 2);
    }

    #[test]
    fn test_non_positive_measurement_skips_point() {
        let row = |result_id: i64, values: Vec<f64>| NamedResultData {
            benchmark: "cpu".to_string(),
            data: crate::models::result_data::ResultData {
                id: result_id,
                benchmark_id: 1,
                result_id,
                test_job_id: None,
                name: "score".to_string(),
                values,
                board: String::new(),
                created_at: at("2024-01-01T00:00:00Z"),
            },
        };
        let points = summarize(&[row(2, vec![3.0, 0.0]), row(1, vec![9.0])]);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].result, 1);
        assert!((points[0].measurement - 9.0).abs() < 1e-9);
    }
}
