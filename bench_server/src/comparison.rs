//! Per-benchmark, per-subscore comparison of two sets of measurements.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::stats::{mean, population_stddev};

/// benchmark name -> subscore name -> raw measurements.
pub type BenchmarkValues = BTreeMap<String, BTreeMap<String, Vec<f64>>>;

/// benchmark name -> subscore name -> diff.
pub type Comparison = BTreeMap<String, BTreeMap<String, SubscoreDiff>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Delta {
    pub base: f64,
    pub target: f64,
    /// `target - base`.
    pub diff: f64,
}

impl Delta {
    fn new(base: f64, target: f64) -> Self {
        Self {
            base,
            target,
            diff: target - base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubscoreDiff {
    pub avg: Delta,
    pub stddev: Delta,
}

/// Which side(s) of a comparison actually carried measurements for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Both,
    BaseOnly,
    TargetOnly,
}

/// One ranked row of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEntry {
    pub benchmark: String,
    pub subscore: String,
    /// Signed severity; positive means the target grew relative to the base.
    pub change: f64,
    pub diff: SubscoreDiff,
    pub presence: Presence,
}

fn lookup<'a>(values: &'a BenchmarkValues, benchmark: &str, subscore: &str) -> Option<&'a [f64]> {
    values
        .get(benchmark)
        .and_then(|s| s.get(subscore))
        .map(Vec::as_slice)
}

fn keys(before: &BenchmarkValues, after: &BenchmarkValues) -> BTreeSet<(String, String)> {
    before
        .iter()
        .chain(after.iter())
        .flat_map(|(bench, subs)| subs.keys().map(move |s| (bench.clone(), s.clone())))
        .collect()
}

/// Compare `before` (base) against `after` (target).
///
/// A key present on one side only is compared against itself, so it reports
/// `target == base` and a zero diff. Use [`presence`] to tell such rows apart
/// from measured ones.
pub fn compare(before: &BenchmarkValues, after: &BenchmarkValues) -> Comparison {
    let mut out = Comparison::new();

    for (bench, sub) in keys(before, after) {
        let base = lookup(before, &bench, &sub);
        let target = lookup(after, &bench, &sub);
        let (base, target) = match (base, target) {
            (Some(b), Some(t)) => (b, t),
            (Some(b), None) => (b, b),
            (None, Some(t)) => (t, t),
            (None, None) => continue,
        };

        let diff = SubscoreDiff {
            avg: Delta::new(mean(base), mean(target)),
            stddev: Delta::new(population_stddev(base), population_stddev(target)),
        };
        out.entry(bench).or_default().insert(sub, diff);
    }

    out
}

/// Report which side carried data for a benchmark/subscore key.
pub fn presence(
    before: &BenchmarkValues,
    after: &BenchmarkValues,
    benchmark: &str,
    subscore: &str,
) -> Option<Presence> {
    match (
        lookup(before, benchmark, subscore).is_some(),
        lookup(after, benchmark, subscore).is_some(),
    ) {
        (true, true) => Some(Presence::Both),
        (true, false) => Some(Presence::BaseOnly),
        (false, true) => Some(Presence::TargetOnly),
        (false, false) => None,
    }
}

/// Compare and flatten into entries ranked by `change`, largest first.
pub fn rank_changes(before: &BenchmarkValues, after: &BenchmarkValues) -> Vec<ChangeEntry> {
    let comparison = compare(before, after);
    let mut entries: Vec<ChangeEntry> = comparison
        .into_iter()
        .flat_map(|(bench, subs)| {
            subs.into_iter().map(move |(sub, diff)| (bench.clone(), sub, diff))
        })
        .map(|(benchmark, subscore, diff)| {
            let presence =
                presence(before, after, &benchmark, &subscore).unwrap_or(Presence::Both);
            ChangeEntry {
                change: diff.avg.diff,
                benchmark,
                subscore,
                diff,
                presence,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.change
            .partial_cmp(&a.change)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.benchmark.cmp(&b.benchmark))
            .then_with(|| a.subscore.cmp(&b.subscore))
    });
    entries
}

/// Number of entries whose target grew beyond the base.
pub fn regressions(entries: &[ChangeEntry]) -> usize {
    entries
        .iter()
        .filter(|e| e.presence == Presence::Both && e.change > 0.0)
        .count()
}
