//! ART Jenkins results: payloads uploaded directly with the submission.
//!
//! There is nothing to poll. The job is complete the moment it is created and
//! its measurements come from the uploaded JSON.

use async_trait::async_trait;

use super::{JobDetails, RunnerKind, TestJobResult, TestRunner};
use crate::error::RunnerError;
use crate::models::test_job::TestJobStatus;

/// Parse an uploaded results payload:
/// `[{"benchmark_name": .., "board": .., "subscore": [{"name": .., "measurement": ..}]}]`.
pub fn parse_test_results(payload: &[u8]) -> Result<Vec<TestJobResult>, RunnerError> {
    serde_json::from_slice(payload)
        .map_err(|e| RunnerError::Protocol(format!("invalid results payload: {e}")))
}

pub struct JenkinsRunner {
    url: String,
}

impl JenkinsRunner {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    fn unsupported(operation: &'static str) -> RunnerError {
        RunnerError::Unsupported {
            runner: RunnerKind::ArtJenkins.tag(),
            operation,
        }
    }
}

#[async_trait]
impl TestRunner for JenkinsRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::ArtJenkins
    }

    async fn get_test_job_status(&self, _job_id: &str) -> Result<TestJobStatus, RunnerError> {
        Ok(TestJobStatus::Complete)
    }

    fn get_job_url(&self, _job_id: &str) -> Option<String> {
        Some(self.url.clone())
    }

    async fn get_result_class_name(&self, _job_id: &str) -> Result<RunnerKind, RunnerError> {
        Ok(RunnerKind::ArtJenkins)
    }

    async fn get_test_job_details(&self, _job_id: &str) -> Result<JobDetails, RunnerError> {
        Ok(JobDetails::default())
    }

    async fn get_test_job_results(
        &self,
        _job_id: &str,
    ) -> Result<Vec<TestJobResult>, RunnerError> {
        Err(Self::unsupported("get_test_job_results"))
    }

    async fn get_result_data(
        &self,
        _job_id: &str,
    ) -> Result<Option<(String, Vec<u8>)>, RunnerError> {
        Ok(None)
    }

    async fn resubmit(&self, _job_id: &str) -> Result<Vec<String>, RunnerError> {
        Err(Self::unsupported("resubmit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        let payload = br#"[
            {"benchmark_name": "cpu", "board": "juno",
             "subscore": [{"name": "dhrystone", "measurement": 10},
                          {"name": "dhrystone", "measurement": "12"}]},
            {"benchmark_name": "memory",
             "subscore": []}
        ]"#;
        let results = parse_test_results(payload).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].subscore[1].measurement, 12.0);
        assert_eq!(results[1].board, "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_test_results(b"{not json"),
            Err(RunnerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_resubmit_unsupported() {
        let runner = JenkinsRunner::new("http://ci.example.org/job/x/1/");
        assert_eq!(
            runner.get_test_job_status("J1").await.unwrap(),
            TestJobStatus::Complete
        );
        assert!(matches!(
            runner.resubmit("J1").await,
            Err(RunnerError::Unsupported { operation: "resubmit", .. })
        ));
    }
}
