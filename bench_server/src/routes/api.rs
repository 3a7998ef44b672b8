//! REST API payloads, error mapping and request parsing.

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::error::{IngestError, StoreError};
use crate::models::result::BenchResult;
use crate::models::test_job::TestJob;
use crate::services::ingest_service::{ResultSubmission, UploadedFile};
use crate::services::progress_service::EnvironmentComparison;

/// Failures surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The job cannot be resubmitted; carries the result's test jobs.
    #[error("Test job cannot be resubmitted")]
    ResubmitRejected(Vec<TestJob>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("Not found: {what}")),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => ApiError::BadRequest(msg),
            IngestError::Store(store) => store.into(),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({"error": msg}))).into_response()
            }
            ApiError::ResubmitRejected(test_jobs) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Test job cannot be resubmitted",
                    "test_jobs": test_jobs,
                })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                tracing::error!("API error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal server error"})),
                )
                    .into_response()
            }
        }
    }
}

/// A result with its test jobs.
#[derive(Debug, Serialize)]
pub struct ResultJson {
    #[serde(flatten)]
    pub result: BenchResult,
    pub test_jobs: Vec<TestJob>,
}

/// A result compared against its baseline, per environment.
#[derive(Debug, Serialize)]
pub struct CompareJson {
    pub result: BenchResult,
    pub baseline: Option<BenchResult>,
    pub environments: Vec<EnvironmentComparison>,
}

#[derive(Debug, Deserialize)]
pub struct AnnotationRequest {
    #[serde(default)]
    pub annotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub comparison_base: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestCompareQuery {
    pub manifest_1: String,
    pub manifest_2: String,
}

#[derive(Debug, Deserialize)]
pub struct BranchCompareQuery {
    pub branch_1: String,
    pub branch_2: String,
}

/// Query pairs shared by the chart endpoints.
#[derive(Debug, Default, PartialEq)]
pub struct ChartParams {
    pub branch: Option<String>,
    pub environment: Option<String>,
    pub benchmarks: Vec<String>,
    pub limit: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Parse chart query pairs. `benchmarks` may repeat or be comma-separated;
/// dates are Unix timestamps in seconds; a negative or malformed limit is
/// ignored.
pub fn parse_chart_params(pairs: &[(String, String)]) -> Result<ChartParams, ApiError> {
    let mut params = ChartParams::default();
    for (key, value) in pairs {
        match key.as_str() {
            "branch" => params.branch = Some(value.clone()),
            "environment" => params.environment = Some(value.clone()),
            "benchmarks" => params.benchmarks.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string),
            ),
            "limit" => params.limit = value.trim().parse().ok().filter(|n: &i64| *n >= 0),
            "startDate" => params.start = Some(timestamp(key, value)?),
            "endDate" => params.end = Some(timestamp(key, value)?),
            _ => {}
        }
    }
    Ok(params)
}

fn timestamp(key: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{key} must be a Unix timestamp")))?;
    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        .ok_or_else(|| ApiError::BadRequest(format!("{key} is out of range")))
}

fn optional(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn integer(field: &str, value: &str) -> Result<i64, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be an integer")))
}

fn multipart_error(e: MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Malformed multipart body: {e}"))
}

/// Read a multipart submission. Text fields fill the submission; fields that
/// carry a file name are kept as uploads.
pub async fn read_multipart(mut multipart: Multipart) -> Result<ResultSubmission, ApiError> {
    let mut submission = ResultSubmission::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_some() {
            let bytes = field.bytes().await.map_err(multipart_error)?;
            submission.files.push(UploadedFile {
                field_name: name,
                bytes: bytes.to_vec(),
            });
            continue;
        }

        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "name" => submission.name = value,
            "build_id" => submission.build_id = integer("build_id", &value)?,
            "build_number" => submission.build_number = integer("build_number", &value)?,
            "build_url" => submission.build_url = value,
            "branch_name" => submission.branch_name = value,
            "gerrit_change_number" => submission.gerrit_change_number = optional(value),
            "gerrit_patchset_number" => submission.gerrit_patchset_number = optional(value),
            "gerrit_change_id" => submission.gerrit_change_id = optional(value),
            "gerrit_change_url" => submission.gerrit_change_url = optional(value),
            "manifest" => submission.manifest = value,
            "test_jobs" => submission.test_jobs = optional(value),
            other => tracing::debug!(field = other, "Ignoring unknown submission field"),
        }
    }
    Ok(submission)
}
