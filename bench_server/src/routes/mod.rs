//! Benchmark results HTTP routes — submission, comparison, dashboards.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::dashboard::summary::{self, SummaryQuery};
use crate::services::ingest_service::{self, IngestReceipt, ResultSubmission};
use crate::services::progress_service::{self, BranchComparison};
use crate::services::result_service::{self, AnnotationPoint};
use crate::services::test_job_service::{self, ResubmitOutcome};
use crate::services::ServiceContext;
use crate::store::pg::PgStore;

use api::ApiError;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ServiceContext>,
    /// Database handle for the health check; absent when running without one.
    pub db: Option<PgStore>,
}

/// Build the API router (nested at `/api`).
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        // Results
        .route("/results", post(submit_result))
        .route("/results/{id}", get(get_result))
        .route("/results/{id}/baseline", get(get_baseline))
        .route("/results/{id}/compare", get(compare_result))
        .route("/results/{id}/annotation", post(save_annotation))
        // Comparisons
        .route("/compare/manifest", get(compare_manifests))
        .route("/compare/branch", get(compare_branches))
        // Test jobs
        .route("/testjobs/{id}/resubmit", post(resubmit_test_job))
        .route("/testjobs/{id}/data", get(download_test_job_data))
        .route("/manifests/{hash}", get(download_manifest))
        // Dashboard
        .route("/summary", get(benchmark_summary))
        .route("/annotations", get(annotations))
        .route("/health", get(health))
        .with_state(state)
}

/// The full application: `/api` plus the HTTP middleware stack.
pub fn app(state: ApiState) -> Router {
    Router::new()
        .nest("/api", api_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
}

// ── Results ──

async fn submit_result(
    State(state): State<ApiState>,
    request: Request,
) -> Result<(StatusCode, Json<IngestReceipt>), ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let submission = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        api::read_multipart(multipart).await?
    } else {
        let Json(submission) = Json::<ResultSubmission>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        submission
    };

    let receipt = ingest_service::submit_result(&state.ctx, submission).await?;
    let status = if receipt.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

async fn get_result(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<api::ResultJson>, ApiError> {
    let store = state.ctx.store.as_ref();
    let result = result_service::get_result(store, id).await?;
    let test_jobs = store.test_jobs_for_result(id).await?;
    Ok(Json(api::ResultJson { result, test_jobs }))
}

async fn get_baseline(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = state.ctx.store.as_ref();
    let result = result_service::get_result(store, id).await?;
    match result_service::to_compare(store, &result, state.ctx.config.ignore_gerrit).await? {
        Some(baseline) => Ok(Json(baseline).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn compare_result(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(query): Query<api::CompareQuery>,
) -> Result<Json<api::CompareJson>, ApiError> {
    let store = state.ctx.store.as_ref();
    let result = result_service::get_result(store, id).await?;
    let baseline = result_service::resolve_baseline(
        store,
        &result,
        query.comparison_base,
        state.ctx.config.ignore_gerrit,
    )
    .await?;
    let environments = match &baseline {
        Some(base) => progress_service::progress_between_results(store, &result, base).await?,
        None => Vec::new(),
    };
    Ok(Json(api::CompareJson {
        result,
        baseline,
        environments,
    }))
}

async fn save_annotation(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<api::AnnotationRequest>,
) -> Result<StatusCode, ApiError> {
    result_service::save_annotation(state.ctx.store.as_ref(), id, req.annotation).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Comparisons ──

async fn compare_manifests(
    State(state): State<ApiState>,
    Query(query): Query<api::ManifestCompareQuery>,
) -> Result<Json<crate::comparison::Comparison>, ApiError> {
    let comparison = progress_service::compare_manifests(
        state.ctx.store.as_ref(),
        &query.manifest_1,
        &query.manifest_2,
    )
    .await?;
    Ok(Json(comparison))
}

async fn compare_branches(
    State(state): State<ApiState>,
    Query(query): Query<api::BranchCompareQuery>,
) -> Result<Json<BranchComparison>, ApiError> {
    let comparison = progress_service::compare_branches(
        state.ctx.store.as_ref(),
        &query.branch_1,
        &query.branch_2,
        state.ctx.config.ignore_gerrit,
    )
    .await?;
    Ok(Json(comparison))
}

// ── Test jobs ──

async fn resubmit_test_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::models::test_job::TestJob>>, ApiError> {
    match test_job_service::resubmit(&state.ctx, &id).await? {
        ResubmitOutcome::Accepted(test_jobs) => Ok(Json(test_jobs)),
        ResubmitOutcome::Rejected(test_jobs) => Err(ApiError::ResubmitRejected(test_jobs)),
    }
}

async fn download_test_job_data(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .ctx
        .store
        .test_job(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Not found: test job {id}")))?;
    let (Some(filename), Some(data)) = (job.data_filename(), job.data) else {
        return Err(ApiError::NotFound(format!("Test job {id} has no data")));
    };
    Ok(attachment(&filename, "application/octet-stream", data))
}

async fn download_manifest(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let manifest = state
        .ctx
        .store
        .manifest_by_hash(&hash)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Not found: manifest {hash}")))?;
    Ok(attachment(
        &format!("{}.xml", manifest.manifest_hash),
        "application/xml",
        manifest.manifest.into_bytes(),
    ))
}

fn attachment(filename: &str, content_type: &'static str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

// ── Dashboard ──

async fn benchmark_summary(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<summary::SummaryPoint>>, ApiError> {
    let params = api::parse_chart_params(&pairs)?;
    let query = SummaryQuery {
        branch: params.branch,
        environment: params.environment,
        benchmarks: params.benchmarks,
        limit: params.limit,
        start: params.start,
        end: params.end,
    };
    let points =
        summary::benchmark_summary(state.ctx.store.as_ref(), &query, state.ctx.config.ignore_gerrit)
            .await?;
    Ok(Json(points))
}

async fn annotations(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<AnnotationPoint>>, ApiError> {
    let params = api::parse_chart_params(&pairs)?;
    let points = result_service::annotations(
        state.ctx.store.as_ref(),
        params.start,
        params.end,
        params.limit,
    )
    .await?;
    Ok(Json(points))
}

async fn health(State(state): State<ApiState>) -> Response {
    let Some(db) = &state.db else {
        return Json(json!({"status": "ok"})).into_response();
    };
    match db.ping().await {
        Ok(()) => Json(json!({"status": "ok", "database": "up"})).into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "database": "down"})),
            )
                .into_response()
        }
    }
}
