//! LAVA test runner over the REST API (v0.2).

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{JobDetails, Measurement, RunnerKind, TestJobResult, TestRunner};
use crate::config::RunnerCredentials;
use crate::error::RunnerError;
use crate::models::test_job::TestJobStatus;

/// LAVA prefixes suite names with their position in the job ("0_cpu").
static SUITE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+_").unwrap());

/// Suite LAVA adds to every job for its own bookkeeping.
const INTERNAL_SUITE: &str = "lava";

#[derive(Debug, Deserialize)]
struct JobInfo {
    state: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    requested_device_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    next: Option<String>,
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Suite {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TestCase {
    name: String,
    suite: i64,
    #[serde(default)]
    measurement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResubmitResponse {
    #[serde(default)]
    job_ids: Vec<serde_json::Value>,
    #[serde(default)]
    job_id: Option<serde_json::Value>,
}

/// Map LAVA's `(state, health)` pair onto a test job status.
pub fn map_status(state: &str, health: &str) -> Result<TestJobStatus, RunnerError> {
    match state {
        "Submitted" | "Scheduling" | "Scheduled" => Ok(TestJobStatus::Submitted),
        "Running" | "Canceling" => Ok(TestJobStatus::Running),
        "Finished" => match health {
            "Complete" => Ok(TestJobStatus::Complete),
            "Incomplete" => Ok(TestJobStatus::Incomplete),
            "Canceled" => Ok(TestJobStatus::Canceled),
            other => Err(RunnerError::Protocol(format!(
                "finished job with unexpected health {other:?}"
            ))),
        },
        other => Err(RunnerError::Protocol(format!("unknown job state {other:?}"))),
    }
}

/// Group test cases into one result per suite, dropping LAVA's own suite and
/// cases without a measurement.
fn group_results(
    suites: &[Suite],
    cases: Vec<TestCase>,
    board: &str,
) -> Result<Vec<TestJobResult>, RunnerError> {
    let names: HashMap<i64, &str> = suites.iter().map(|s| (s.id, s.name.as_str())).collect();
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Measurement>> = HashMap::new();

    for case in cases {
        let Some(raw) = case.measurement else {
            continue;
        };
        let Some(suite) = names.get(&case.suite) else {
            continue;
        };
        if *suite == INTERNAL_SUITE {
            continue;
        }
        let measurement: f64 = raw.trim().parse().map_err(|_| {
            RunnerError::Protocol(format!("measurement {raw:?} of {} is not a number", case.name))
        })?;
        let benchmark = SUITE_PREFIX.replace(suite, "").into_owned();
        if !grouped.contains_key(&benchmark) {
            order.push(benchmark.clone());
        }
        grouped.entry(benchmark).or_default().push(Measurement {
            name: case.name,
            measurement,
        });
    }

    Ok(order
        .into_iter()
        .map(|benchmark_name| TestJobResult {
            subscore: grouped.remove(&benchmark_name).unwrap_or_default(),
            benchmark_name,
            board: board.to_string(),
        })
        .collect())
}

pub struct LavaRunner {
    client: reqwest::Client,
    base: String,
    credentials: RunnerCredentials,
}

impl LavaRunner {
    pub fn new(client: reqwest::Client, url: &str, credentials: RunnerCredentials) -> Self {
        // Job rows may still carry the XML-RPC endpoint.
        let base = url
            .trim_end_matches('/')
            .trim_end_matches("/RPC2")
            .to_string();
        Self {
            client,
            base,
            credentials,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v0.2/{}", self.base, path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(
            reqwest::header::AUTHORIZATION,
            format!("Token {}", self.credentials.token),
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RunnerError> {
        let resp = self
            .auth(self.client.get(url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, RunnerError> {
        let mut url = Some(self.api(path));
        let mut items = Vec::new();
        while let Some(next) = url {
            let page: Page<T> = self.get_json(&next).await?;
            items.extend(page.results);
            url = page.next;
        }
        Ok(items)
    }

    async fn job(&self, job_id: &str) -> Result<JobInfo, RunnerError> {
        self.get_json(&self.api(&format!("jobs/{job_id}/"))).await
    }
}

#[async_trait]
impl TestRunner for LavaRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Lava
    }

    async fn get_test_job_status(&self, job_id: &str) -> Result<TestJobStatus, RunnerError> {
        let job = self.job(job_id).await?;
        map_status(&job.state, &job.health)
    }

    fn get_job_url(&self, job_id: &str) -> Option<String> {
        Some(format!("{}/scheduler/job/{job_id}", self.base))
    }

    async fn get_result_class_name(&self, _job_id: &str) -> Result<RunnerKind, RunnerError> {
        Ok(RunnerKind::Lava)
    }

    async fn get_test_job_details(&self, job_id: &str) -> Result<JobDetails, RunnerError> {
        let job = self.job(job_id).await?;
        Ok(JobDetails {
            definition: job.definition,
        })
    }

    async fn get_test_job_results(
        &self,
        job_id: &str,
    ) -> Result<Vec<TestJobResult>, RunnerError> {
        let job = self.job(job_id).await?;
        let board = job.requested_device_type.unwrap_or_default();
        let suites: Vec<Suite> = self.get_all(&format!("jobs/{job_id}/suites/")).await?;
        let cases: Vec<TestCase> = self.get_all(&format!("jobs/{job_id}/tests/")).await?;
        group_results(&suites, cases, &board)
    }

    async fn get_result_data(
        &self,
        job_id: &str,
    ) -> Result<Option<(String, Vec<u8>)>, RunnerError> {
        let resp = self
            .auth(self.client.get(self.api(&format!("jobs/{job_id}/logs/"))))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = resp.error_for_status()?.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(("yaml".to_string(), bytes.to_vec())))
    }

    async fn resubmit(&self, job_id: &str) -> Result<Vec<String>, RunnerError> {
        let resp = self
            .auth(
                self.client
                    .post(self.api(&format!("jobs/{job_id}/resubmit/"))),
            )
            .send()
            .await?
            .error_for_status()?;
        let body: ResubmitResponse = resp.json().await?;

        let ids: Vec<String> = body
            .job_ids
            .into_iter()
            .chain(body.job_id)
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        if ids.is_empty() {
            return Err(RunnerError::Protocol(format!(
                "resubmit of {job_id} returned no job ids"
            )));
        }
        Ok(ids)
    }
}
