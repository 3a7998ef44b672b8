//! Gerrit integration — review messages for pre-merge benchmark builds.

use std::fmt::Write as _;

use async_trait::async_trait;

use crate::models::result::BenchResult;
use crate::models::test_job::TestJob;

/// Posts a review message on the change a result was built from.
#[async_trait]
pub trait ReviewNotifier: Send + Sync {
    async fn post_review(&self, result: &BenchResult, message: &str) -> anyhow::Result<()>;
}

pub struct GerritClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl GerritClient {
    pub fn new(base_url: &str, user: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    fn review_url(&self, change: &str, patchset: &str) -> String {
        format!(
            "{}/a/changes/{change}/revisions/{patchset}/review",
            self.base_url
        )
    }
}

#[async_trait]
impl ReviewNotifier for GerritClient {
    async fn post_review(&self, result: &BenchResult, message: &str) -> anyhow::Result<()> {
        if self.base_url.is_empty() || self.user.is_empty() {
            tracing::debug!("Gerrit not configured, skipping review");
            return Ok(());
        }
        let (Some(change), Some(patchset)) = (
            result.gerrit_change_number.as_deref(),
            result.gerrit_patchset_number.as_deref(),
        ) else {
            tracing::debug!(result_id = result.id, "Result has no Gerrit change, skipping review");
            return Ok(());
        };

        let body = serde_json::json!({ "message": message });
        let resp = self
            .client
            .post(self.review_url(change, patchset))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gerrit review failed for change {change}/{patchset}: {status} {text}");
        }
        tracing::info!(result_id = result.id, change, patchset, "Gerrit updated");
        Ok(())
    }
}

/// Plain-text review message for a completed result.
pub fn review_message(
    result: &BenchResult,
    test_jobs: &[TestJob],
    baseline: Option<(&BenchResult, usize)>,
    dashboard_url: &str,
) -> String {
    let mut msg = format!(
        "Benchmark results for {} build #{} are available.\n",
        result.name, result.build_number
    );
    let _ = writeln!(
        msg,
        "{}/results/{}",
        dashboard_url.trim_end_matches('/'),
        result.id
    );

    match baseline {
        Some((base, 0)) => {
            let _ = writeln!(msg, "\nNo regressions against {} build #{}.", base.name, base.build_number);
        }
        Some((base, count)) => {
            let _ = writeln!(
                msg,
                "\n{count} subscore(s) regressed against {} build #{}.",
                base.name, base.build_number
            );
        }
        None => msg.push_str("\nNo baseline available for comparison.\n"),
    }

    if !test_jobs.is_empty() {
        msg.push_str("\nTest jobs:\n");
        for job in test_jobs {
            let _ = writeln!(
                msg,
                "  {} [{}] {}",
                job.id,
                job.status(),
                job.url.as_deref().unwrap_or("")
            );
        }
    }
    msg
}
