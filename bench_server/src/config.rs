//! Server configuration — loaded from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Credentials for one test runner host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerCredentials {
    pub username: String,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct BenchConfig {
    /// Treat Gerrit pre-merge builds as baselines too.
    pub ignore_gerrit: bool,
    /// Delay before follow-up work of a submission becomes due.
    pub follow_up_delay_secs: u64,
    /// Total attempts for a conflicting submission.
    pub create_max_attempts: u32,
    /// Delay between conflicting submission attempts.
    pub create_retry_delay_ms: u64,
    /// Handlers the worker pool runs at once.
    pub worker_concurrency: usize,
    /// Seconds between queue polls.
    pub poll_interval_secs: u64,
    /// Attempts before a task is marked failed.
    pub task_max_attempts: i32,
    /// Seconds after which a running task is considered abandoned.
    pub task_visibility_secs: u64,
    /// Seconds between completeness sweeps.
    pub completeness_interval_secs: u64,
    /// Runner URL for test job ids submitted without one.
    pub default_runner_url: String,
    /// Credentials keyed by runner host.
    pub runner_credentials: HashMap<String, RunnerCredentials>,
    pub gerrit_url: String,
    pub gerrit_user: String,
    pub gerrit_password: String,
    /// Dashboard base URL used in review messages.
    pub dashboard_url: String,
}

impl BenchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let ignore_gerrit = get("BENCH_IGNORE_GERRIT")
            .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let default_runner_url = get("BENCH_DEFAULT_RUNNER_URL")
            .unwrap_or_else(|| "https://validation.linaro.org/".to_string());
        let runner_credentials = get("BENCH_RUNNER_CREDENTIALS")
            .map(|s| parse_credentials(&s))
            .unwrap_or_default();
        let gerrit_url = get("BENCH_GERRIT_URL").unwrap_or_default();
        let gerrit_user = get("BENCH_GERRIT_USER").unwrap_or_default();
        let gerrit_password = get("BENCH_GERRIT_PASSWORD").unwrap_or_default();
        let dashboard_url =
            get("BENCH_DASHBOARD_URL").unwrap_or_else(|| "http://localhost:9090".to_string());

        if runner_credentials.is_empty() {
            tracing::warn!("BENCH_RUNNER_CREDENTIALS not set -- LAVA test jobs cannot be fetched");
        }
        if gerrit_url.is_empty() || gerrit_user.is_empty() {
            tracing::warn!("BENCH_GERRIT_URL/BENCH_GERRIT_USER not set -- Gerrit reviews disabled");
        }

        Self {
            ignore_gerrit,
            follow_up_delay_secs: parsed(get("BENCH_FOLLOW_UP_DELAY_SECS"), 60),
            create_max_attempts: parsed(get("BENCH_CREATE_MAX_ATTEMPTS"), 10),
            create_retry_delay_ms: parsed(get("BENCH_CREATE_RETRY_DELAY_MS"), 500),
            worker_concurrency: parsed(get("BENCH_WORKER_CONCURRENCY"), 4usize).max(1),
            poll_interval_secs: parsed(get("BENCH_POLL_INTERVAL_SECS"), 5),
            task_max_attempts: parsed(get("BENCH_TASK_MAX_ATTEMPTS"), 5),
            task_visibility_secs: parsed(get("BENCH_TASK_VISIBILITY_SECS"), 600),
            completeness_interval_secs: parsed(get("BENCH_COMPLETENESS_INTERVAL_SECS"), 600),
            default_runner_url,
            runner_credentials,
            gerrit_url,
            gerrit_user,
            gerrit_password,
            dashboard_url,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.create_max_attempts,
            Duration::from_millis(self.create_retry_delay_ms),
        )
    }

    pub fn follow_up_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.follow_up_delay_secs as i64)
    }

    pub fn gerrit_enabled(&self) -> bool {
        !self.gerrit_url.is_empty() && !self.gerrit_user.is_empty()
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Parse `host=user:token,host2=user2:token2`. Malformed entries are skipped.
fn parse_credentials(raw: &str) -> HashMap<String, RunnerCredentials> {
    raw.split(',')
        .filter_map(|entry| {
            let (host, creds) = entry.trim().split_once('=')?;
            let (username, token) = creds.split_once(':')?;
            let host = host.trim();
            if host.is_empty() {
                return None;
            }
            Some((
                host.to_string(),
                RunnerCredentials {
                    username: username.trim().to_string(),
                    token: token.trim().to_string(),
                },
            ))
        })
        .collect()
}
