//! Test job lifecycle events and the aggregate they fold into.
//!
//! Polling may skip intermediate states (a job seen first as `Complete` is
//! fine), but a job that has been marked completed never changes status
//! again: `Results Missing` and stored results are both final.

use serde::{Deserialize, Serialize};

use crate::models::test_job::{TestJob, TestJobStatus, TestJobUpdate};

/// Events that can happen to a test job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestJobEvent {
    /// The runner reported a status for the job.
    StatusPolled {
        status: TestJobStatus,
        url: Option<String>,
    },
    /// The concrete runner class for the job was resolved.
    RunnerResolved { runner_kind: String },
    /// The board the job ran on was identified.
    EnvironmentResolved { environment_id: i64 },
    /// The job finished and produced measurements.
    ResultsStored {
        definition: Option<String>,
        rows: usize,
        #[serde(skip)]
        data: Option<(String, Vec<u8>)>,
    },
    /// The job finished without any measurements.
    ResultsMissing { definition: Option<String> },
}

/// Aggregate state for a test job.
#[derive(Debug, Clone)]
pub struct TestJobAggregate {
    pub status: TestJobStatus,
    pub initialized: bool,
    pub completed: bool,
    pub environment_id: Option<i64>,
    pub runner_kind: String,
    pub url: Option<String>,
    pub definition: Option<String>,
    pub data: Option<(String, Vec<u8>)>,
}

impl TestJobAggregate {
    pub fn from_job(job: &TestJob) -> Self {
        Self {
            status: job.status(),
            initialized: job.initialized,
            completed: job.completed,
            environment_id: job.environment_id,
            runner_kind: job.runner_kind.clone(),
            url: job.url.clone(),
            definition: job.definition.clone(),
            data: None,
        }
    }

    pub fn apply(&mut self, event: &TestJobEvent) {
        match event {
            TestJobEvent::StatusPolled { status, url } => {
                if self.completed {
                    return;
                }
                self.status = *status;
                if url.is_some() {
                    self.url = url.clone();
                }
            }
            TestJobEvent::RunnerResolved { runner_kind } => {
                self.runner_kind = runner_kind.clone();
                self.initialized = true;
            }
            TestJobEvent::EnvironmentResolved { environment_id } => {
                // An environment given at submission wins.
                if self.environment_id.is_none() {
                    self.environment_id = Some(*environment_id);
                }
            }
            TestJobEvent::ResultsStored {
                definition, data, ..
            } => {
                self.definition = definition.clone();
                self.data = data.clone();
                self.completed = true;
            }
            TestJobEvent::ResultsMissing { definition } => {
                self.definition = definition.clone();
                self.status = TestJobStatus::ResultsMissing;
                self.completed = true;
            }
        }
    }

    /// Row update carrying the folded state.
    pub fn to_update(&self) -> TestJobUpdate {
        let (data_filetype, data) = match &self.data {
            Some((filetype, bytes)) => (Some(filetype.clone()), Some(bytes.clone())),
            None => (None, None),
        };
        TestJobUpdate {
            status: self.status.as_str().to_string(),
            initialized: self.initialized,
            completed: self.completed,
            environment_id: self.environment_id,
            runner_kind: self.runner_kind.clone(),
            url: self.url.clone(),
            definition: self.definition.clone(),
            data,
            data_filetype,
        }
    }
}
