//! Progress between results: per-environment pairing, time windows, and
//! manifest / branch comparisons.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::comparison::{compare, rank_changes, regressions, BenchmarkValues, ChangeEntry, Comparison};
use crate::error::StoreResult;
use crate::models::result::BenchResult;
use crate::models::result_data::NamedResultData;
use crate::services::ServiceContext;
use crate::store::{DataFilter, ResultFilter, Store};

/// Reporting window for progress digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressWindow {
    Weekly,
    Monthly,
}

impl ProgressWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Inclusive start of the window ending at `now`.
    pub fn lower_bound(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Weekly => now - chrono::Duration::days(7),
            Self::Monthly => now
                .checked_sub_months(Months::new(1))
                .unwrap_or(now - chrono::Duration::days(30)),
        }
    }
}

/// Comparison of one environment between two results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentComparison {
    pub environment: String,
    /// `before` had no data for this environment; all of its data was used.
    pub fallback: bool,
    pub comparison: Comparison,
    pub changes: Vec<ChangeEntry>,
}

/// Fold result data rows into benchmark -> subscore -> values.
pub fn values_of<'a>(rows: impl IntoIterator<Item = &'a NamedResultData>) -> BenchmarkValues {
    let mut values = BenchmarkValues::new();
    for row in rows {
        values
            .entry(row.benchmark.clone())
            .or_default()
            .entry(row.data.name.clone())
            .or_default()
            .extend_from_slice(&row.data.values);
    }
    values
}

async fn data_for_result<S: Store + ?Sized>(
    store: &S,
    result_id: i64,
) -> StoreResult<Vec<NamedResultData>> {
    store
        .find_result_data(&DataFilter {
            result_ids: Some(vec![result_id]),
            ..Default::default()
        })
        .await
}

/// Pairing key for data whose test job has no environment.
pub const NO_ENVIRONMENT: &str = "(none)";

/// test job id -> environment identifier, for one result. Jobs without an
/// environment map to [`NO_ENVIRONMENT`].
async fn job_environments<S: Store + ?Sized>(
    store: &S,
    result_id: i64,
) -> StoreResult<HashMap<String, String>> {
    let jobs = store.test_jobs_for_result(result_id).await?;
    let env_ids: Vec<i64> = jobs.iter().filter_map(|j| j.environment_id).collect();
    let envs: HashMap<i64, String> = store
        .environments(&env_ids)
        .await?
        .into_iter()
        .map(|e| (e.id, e.identifier))
        .collect();
    Ok(jobs
        .into_iter()
        .map(|j| {
            let ident = j
                .environment_id
                .and_then(|id| envs.get(&id).cloned())
                .unwrap_or_else(|| NO_ENVIRONMENT.to_string());
            (j.id, ident)
        })
        .collect())
}

/// Compare `current` against `previous`, environment by environment.
///
/// Data from test jobs without an environment is compared under
/// [`NO_ENVIRONMENT`]. That entry, and any environment `previous` has nothing
/// for, is compared against all of `previous`'s data for the benchmarks
/// `current` measured there.
pub async fn progress_between_results<S: Store + ?Sized>(
    store: &S,
    current: &BenchResult,
    previous: &BenchResult,
) -> StoreResult<Vec<EnvironmentComparison>> {
    let current_envs = job_environments(store, current.id).await?;
    let previous_envs = job_environments(store, previous.id).await?;
    let current_data = data_for_result(store, current.id).await?;
    let previous_data = data_for_result(store, previous.id).await?;

    let env_of = |envs: &HashMap<String, String>, row: &NamedResultData| -> String {
        row.data
            .test_job_id
            .as_deref()
            .and_then(|id| envs.get(id).cloned())
            .unwrap_or_else(|| NO_ENVIRONMENT.to_string())
    };

    let mut after_by_env: BTreeMap<String, Vec<&NamedResultData>> = BTreeMap::new();
    for row in &current_data {
        after_by_env
            .entry(env_of(&current_envs, row))
            .or_default()
            .push(row);
    }
    // Environments whose jobs produced no data still get an (empty) entry.
    for env in current_envs.values().filter(|e| e.as_str() != NO_ENVIRONMENT) {
        after_by_env.entry(env.clone()).or_default();
    }

    let mut out = Vec::with_capacity(after_by_env.len());
    for (env, after_rows) in after_by_env {
        let after = values_of(after_rows.iter().copied());
        let matched: Vec<&NamedResultData> = if env == NO_ENVIRONMENT {
            Vec::new()
        } else {
            previous_data
                .iter()
                .filter(|row| env_of(&previous_envs, *row) == env)
                .collect()
        };

        let fallback = matched.is_empty();
        let before = if fallback {
            let wanted: HashSet<&str> = after.keys().map(String::as_str).collect();
            values_of(
                previous_data
                    .iter()
                    .filter(|row| wanted.contains(row.benchmark.as_str())),
            )
        } else {
            values_of(matched)
        };

        out.push(EnvironmentComparison {
            comparison: compare(&before, &after),
            changes: rank_changes(&before, &after),
            environment: env,
            fallback,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub name: String,
    pub branch: String,
    pub current_id: i64,
    pub baseline_id: i64,
    pub environments: Vec<EnvironmentComparison>,
}

impl ProgressReport {
    pub fn regressions(&self) -> usize {
        self.environments.iter().map(|e| regressions(&e.changes)).sum()
    }
}

/// For every (name, branch) series, compare the latest result inside the
/// window against the latest one before it. Series lacking either side are
/// skipped.
pub async fn compare_progress<S: Store + ?Sized>(
    store: &S,
    now: DateTime<Utc>,
    window: ProgressWindow,
    ignore_gerrit: bool,
) -> StoreResult<Vec<ProgressReport>> {
    let lower = window.lower_bound(now);
    let results = store
        .find_results(&ResultFilter {
            created_until: Some(now),
            exclude_gerrit: !ignore_gerrit,
            ..Default::default()
        })
        .await?;

    // Rows arrive newest first, so the first hit on each side is the latest.
    let mut series: BTreeMap<(String, String), (Option<BenchResult>, Option<BenchResult>)> =
        BTreeMap::new();
    for r in results {
        let slot = series
            .entry((r.branch_name.clone(), r.name.clone()))
            .or_default();
        if r.created_at >= lower {
            if slot.0.is_none() {
                slot.0 = Some(r);
            }
        } else if slot.1.is_none() {
            slot.1 = Some(r);
        }
    }

    let mut reports = Vec::new();
    for ((branch, name), pair) in series {
        let (Some(current), Some(baseline)) = pair else {
            continue;
        };
        let environments = progress_between_results(store, &current, &baseline).await?;
        reports.push(ProgressReport {
            name,
            branch,
            current_id: current.id,
            baseline_id: baseline.id,
            environments,
        });
    }
    Ok(reports)
}

/// Build and log a progress digest for `window`.
pub async fn run_digest(
    ctx: &ServiceContext,
    window: ProgressWindow,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<ProgressReport>> {
    let reports = compare_progress(ctx.store.as_ref(), now, window, ctx.config.ignore_gerrit).await?;
    let total: usize = reports.iter().map(ProgressReport::regressions).sum();

    for report in &reports {
        tracing::info!(
            window = window.as_str(),
            name = %report.name,
            branch = %report.branch,
            current_id = report.current_id,
            baseline_id = report.baseline_id,
            regressions = report.regressions(),
            "Benchmark progress"
        );
    }
    tracing::info!(
        window = window.as_str(),
        series = reports.len(),
        regressions = total,
        "Progress digest complete"
    );
    crate::metrics::regressions_found(window.as_str(), total);
    Ok(reports)
}

async fn values_for_results<S: Store + ?Sized>(
    store: &S,
    results: &[BenchResult],
) -> StoreResult<BenchmarkValues> {
    if results.is_empty() {
        return Ok(BenchmarkValues::new());
    }
    let rows = store
        .find_result_data(&DataFilter {
            result_ids: Some(results.iter().map(|r| r.id).collect()),
            ..Default::default()
        })
        .await?;
    Ok(values_of(&rows))
}

/// Aggregate all data of the results built from each manifest and compare.
/// An unknown hash is an empty side.
pub async fn compare_manifests<S: Store + ?Sized>(
    store: &S,
    base_hash: &str,
    target_hash: &str,
) -> StoreResult<Comparison> {
    let base = store
        .find_results(&ResultFilter {
            manifest_hash: Some(base_hash.to_string()),
            ..Default::default()
        })
        .await?;
    let target = store
        .find_results(&ResultFilter {
            manifest_hash: Some(target_hash.to_string()),
            ..Default::default()
        })
        .await?;
    Ok(compare(
        &values_for_results(store, &base).await?,
        &values_for_results(store, &target).await?,
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchComparison {
    pub base: Option<BenchResult>,
    pub target: Option<BenchResult>,
    pub comparison: Comparison,
}

/// Compare the latest baseline result of each branch.
pub async fn compare_branches<S: Store + ?Sized>(
    store: &S,
    base_branch: &str,
    target_branch: &str,
    ignore_gerrit: bool,
) -> StoreResult<BranchComparison> {
    let latest = |branch: &str| ResultFilter {
        branch: Some(branch.to_string()),
        exclude_gerrit: !ignore_gerrit,
        limit: Some(1),
        ..Default::default()
    };
    let base = store.find_results(&latest(base_branch)).await?.into_iter().next();
    let target = store
        .find_results(&latest(target_branch))
        .await?
        .into_iter()
        .next();

    let comparison = compare(
        &values_for_results(store, base.as_slice()).await?,
        &values_for_results(store, target.as_slice()).await?,
    );
    Ok(BranchComparison {
        base,
        target,
        comparison,
    })
}
