//! Remote test runners.
//!
//! A test job is executed by an external system; the server only polls it.
//! Each job row stores a [`RunnerKind`] tag and the runner's base URL, and the
//! [`RunnerProvider`] turns that pair into a live [`TestRunner`].

pub mod jenkins;
pub mod lava;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::RunnerCredentials;
use crate::error::RunnerError;
use crate::models::test_job::TestJobStatus;

/// Closed set of runner implementations, persisted by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerKind {
    #[serde(rename = "GenericLavaTestSystem")]
    Lava,
    #[serde(rename = "ArtJenkinsTestResults")]
    ArtJenkins,
}

impl RunnerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Lava => "GenericLavaTestSystem",
            Self::ArtJenkins => "ArtJenkinsTestResults",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for RunnerKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GenericLavaTestSystem" => Ok(Self::Lava),
            "ArtJenkinsTestResults" => Ok(Self::ArtJenkins),
            other => Err(RunnerError::UnknownKind(other.to_string())),
        }
    }
}

/// One measurement of a subscore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    #[serde(deserialize_with = "number_or_string")]
    pub measurement: f64,
}

/// Measurements of one benchmark on one board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJobResult {
    pub benchmark_name: String,
    #[serde(default)]
    pub board: String,
    pub subscore: Vec<Measurement>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetails {
    pub definition: Option<String>,
}

/// Accept `12.5` as well as `"12.5"`; runners disagree on the encoding.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    async fn get_test_job_status(&self, job_id: &str) -> Result<TestJobStatus, RunnerError>;

    fn get_job_url(&self, job_id: &str) -> Option<String>;

    /// The concrete runner kind that can interpret this job's results.
    async fn get_result_class_name(&self, job_id: &str) -> Result<RunnerKind, RunnerError>;

    async fn get_test_job_details(&self, job_id: &str) -> Result<JobDetails, RunnerError>;

    async fn get_test_job_results(&self, job_id: &str)
        -> Result<Vec<TestJobResult>, RunnerError>;

    /// Optional raw artifact as `(filetype, bytes)`.
    async fn get_result_data(&self, job_id: &str)
        -> Result<Option<(String, Vec<u8>)>, RunnerError>;

    /// Ask the runner to run the job again; returns the new job ids.
    async fn resubmit(&self, job_id: &str) -> Result<Vec<String>, RunnerError>;

    async fn cleanup(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Resolves a persisted `(kind, url)` pair to a runner.
pub trait RunnerProvider: Send + Sync {
    fn runner(&self, kind: RunnerKind, url: &str) -> Result<Arc<dyn TestRunner>, RunnerError>;
}

/// Host part of a runner URL, used as the credentials key.
pub fn runner_host(url: &str) -> Result<String, RunnerError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| RunnerError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RunnerError::InvalidUrl(url.to_string()))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Production provider: one shared HTTP client, credentials by host.
pub struct RunnerRegistry {
    client: reqwest::Client,
    credentials: HashMap<String, RunnerCredentials>,
}

impl RunnerRegistry {
    pub fn new(credentials: HashMap<String, RunnerCredentials>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bench-results/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            credentials,
        }
    }
}

impl RunnerProvider for RunnerRegistry {
    fn runner(&self, kind: RunnerKind, url: &str) -> Result<Arc<dyn TestRunner>, RunnerError> {
        let host = runner_host(url)?;
        match kind {
            RunnerKind::Lava => {
                let creds = self
                    .credentials
                    .get(&host)
                    .ok_or(RunnerError::MissingCredentials(host))?;
                Ok(Arc::new(lava::LavaRunner::new(
                    self.client.clone(),
                    url,
                    creds.clone(),
                )))
            }
            RunnerKind::ArtJenkins => Ok(Arc::new(jenkins::JenkinsRunner::new(url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            "GenericLavaTestSystem".parse::<RunnerKind>().unwrap(),
            RunnerKind::Lava
        );
        assert_eq!(RunnerKind::ArtJenkins.to_string(), "ArtJenkinsTestResults");
        assert!(matches!(
            "LavaXmlRpc".parse::<RunnerKind>(),
            Err(RunnerError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_runner_host() {
        assert_eq!(
            runner_host("https://validation.linaro.org/RPC2/").unwrap(),
            "validation.linaro.org"
        );
        assert_eq!(
            runner_host("http://ci.example.org:8080/job/x/1/").unwrap(),
            "ci.example.org:8080"
        );
        assert!(runner_host("not a url").is_err());
    }

    #[test]
    fn test_registry_requires_lava_credentials() {
        let registry = RunnerRegistry::new(HashMap::new());
        assert!(matches!(
            registry.runner(RunnerKind::Lava, "https://lava.example.org/"),
            Err(RunnerError::MissingCredentials(host)) if host == "lava.example.org"
        ));
        let jenkins = registry
            .runner(RunnerKind::ArtJenkins, "http://ci.example.org/job/x/1/")
            .unwrap();
        assert_eq!(jenkins.kind(), RunnerKind::ArtJenkins);
    }

    #[test]
    fn test_measurement_accepts_strings() {
        let m: Measurement =
            serde_json::from_str(r#"{"name": "dhrystone", "measurement": "12.5"}"#).unwrap();
        assert_eq!(m.measurement, 12.5);
        let m: Measurement =
            serde_json::from_str(r#"{"name": "dhrystone", "measurement": 3}"#).unwrap();
        assert_eq!(m.measurement, 3.0);
    }
}
