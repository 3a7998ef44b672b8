//! Benchmark services — ingestion, fetching, baselines and progress.

pub mod gerrit_service;
pub mod ingest_service;
pub mod manifest_service;
pub mod progress_service;
pub mod result_service;
pub mod test_job_service;

use std::sync::Arc;

use crate::config::BenchConfig;
use crate::scheduler::TaskQueue;
use crate::store::Store;
use crate::testrunner::RunnerProvider;

use gerrit_service::ReviewNotifier;

/// Everything a service or background handler needs.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub runners: Arc<dyn RunnerProvider>,
    pub reviews: Arc<dyn ReviewNotifier>,
    pub config: BenchConfig,
}
