//! test_jobs — remote test-execution jobs tracked against a result.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::test_jobs;

/// Status reported by a test runner for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestJobStatus {
    /// Never polled yet.
    #[serde(rename = "")]
    Unset,
    Submitted,
    Running,
    Complete,
    Incomplete,
    Canceled,
    #[serde(rename = "Results Missing")]
    ResultsMissing,
}

impl TestJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Complete => "Complete",
            Self::Incomplete => "Incomplete",
            Self::Canceled => "Canceled",
            Self::ResultsMissing => "Results Missing",
        }
    }

    /// The runner has finished with the job; results can be fetched.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Incomplete | Self::Canceled)
    }

    /// A job in this state can be handed back to the runner for another run.
    pub fn allows_resubmit(&self) -> bool {
        matches!(
            self,
            Self::Incomplete | Self::Canceled | Self::ResultsMissing
        )
    }
}

impl fmt::Display for TestJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Unset),
            "Submitted" => Ok(Self::Submitted),
            "Running" => Ok(Self::Running),
            "Complete" => Ok(Self::Complete),
            "Incomplete" => Ok(Self::Incomplete),
            "Canceled" => Ok(Self::Canceled),
            "Results Missing" => Ok(Self::ResultsMissing),
            other => Err(format!("unknown test job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = test_jobs)]
pub struct TestJob {
    pub id: String,
    pub result_id: i64,
    pub status: String,
    pub initialized: bool,
    pub completed: bool,
    pub resubmitted: bool,
    pub environment_id: Option<i64>,
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
    pub data_filetype: Option<String>,
    pub runner_kind: String,
    pub runner_url: String,
    pub url: Option<String>,
    pub definition: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TestJob {
    /// Parsed status; unknown strings read as `Unset`.
    pub fn status(&self) -> TestJobStatus {
        self.status.parse().unwrap_or(TestJobStatus::Unset)
    }

    /// Download name for the stored data blob.
    pub fn data_filename(&self) -> Option<String> {
        let filetype = self.data_filetype.as_deref()?;
        if self.id.ends_with(&format!(".{filetype}")) {
            Some(self.id.clone())
        } else {
            Some(format!("{}.{filetype}", self.id))
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = test_jobs)]
pub struct NewTestJob {
    pub id: String,
    pub result_id: i64,
    pub status: String,
    pub initialized: bool,
    pub completed: bool,
    pub environment_id: Option<i64>,
    pub data: Option<Vec<u8>>,
    pub data_filetype: Option<String>,
    pub runner_kind: String,
    pub runner_url: String,
    pub created_at: DateTime<Utc>,
}

impl NewTestJob {
    /// A job known only by its remote id; status is filled in by polling.
    pub fn pending(
        id: impl Into<String>,
        result_id: i64,
        runner_kind: impl Into<String>,
        runner_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            result_id,
            status: TestJobStatus::Unset.as_str().to_string(),
            initialized: false,
            completed: false,
            environment_id: None,
            data: None,
            data_filetype: None,
            runner_kind: runner_kind.into(),
            runner_url: runner_url.into(),
            created_at: Utc::now(),
        }
    }
}

/// Mutable polling state written back after a runner round-trip. The
/// resubmit latch is not part of it; see `Store::set_resubmitted`.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = test_jobs)]
pub struct TestJobUpdate {
    pub status: String,
    pub initialized: bool,
    pub completed: bool,
    /// `None` leaves the stored environment untouched.
    pub environment_id: Option<i64>,
    pub runner_kind: String,
    pub url: Option<String>,
    pub definition: Option<String>,
    pub data: Option<Vec<u8>>,
    pub data_filetype: Option<String>,
}

impl TestJobUpdate {
    pub fn from_job(job: &TestJob) -> Self {
        Self {
            status: job.status.clone(),
            initialized: job.initialized,
            completed: job.completed,
            environment_id: job.environment_id,
            runner_kind: job.runner_kind.clone(),
            url: job.url.clone(),
            definition: job.definition.clone(),
            data: job.data.clone(),
            data_filetype: job.data_filetype.clone(),
        }
    }

    pub fn apply(&self, job: &mut TestJob) {
        job.status = self.status.clone();
        job.initialized = self.initialized;
        job.completed = self.completed;
        job.runner_kind = self.runner_kind.clone();
        if self.environment_id.is_some() {
            job.environment_id = self.environment_id;
        }
        if self.url.is_some() {
            job.url = self.url.clone();
        }
        if self.definition.is_some() {
            job.definition = self.definition.clone();
        }
        if self.data.is_some() {
            job.data = self.data.clone();
            job.data_filetype = self.data_filetype.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            TestJobStatus::Unset,
            TestJobStatus::Submitted,
            TestJobStatus::Running,
            TestJobStatus::Complete,
            TestJobStatus::Incomplete,
            TestJobStatus::Canceled,
            TestJobStatus::ResultsMissing,
        ] {
            assert_eq!(status.as_str().parse::<TestJobStatus>(), Ok(status));
        }
        assert!("Finished".parse::<TestJobStatus>().is_err());
    }

    #[test]
    fn test_resubmit_eligibility() {
        assert!(!TestJobStatus::Unset.allows_resubmit());
        assert!(!TestJobStatus::Submitted.allows_resubmit());
        assert!(!TestJobStatus::Running.allows_resubmit());
        assert!(!TestJobStatus::Complete.allows_resubmit());
        assert!(TestJobStatus::Incomplete.allows_resubmit());
        assert!(TestJobStatus::Canceled.allows_resubmit());
        assert!(TestJobStatus::ResultsMissing.allows_resubmit());
    }

    #[test]
    fn test_data_filename() {
        let mut job = TestJob {
            id: "J20_build_juno".to_string(),
            result_id: 1,
            status: "Complete".to_string(),
            initialized: true,
            completed: true,
            resubmitted: false,
            environment_id: None,
            data: None,
            data_filetype: Some("json".to_string()),
            runner_kind: "ArtJenkinsTestResults".to_string(),
            runner_url: "http://ci.example.org/job/build/1/".to_string(),
            url: None,
            definition: None,
            created_at: Utc::now(),
        };
        assert_eq!(job.data_filename().as_deref(), Some("J20_build_juno.json"));

        job.id = "result.json".to_string();
        assert_eq!(job.data_filename().as_deref(), Some("result.json"));

        job.data_filetype = None;
        assert_eq!(job.data_filename(), None);
    }
}
