//! Management HTTP surface.
//!
//! REST over the job service plus the Prometheus exposition. Scheduling
//! itself never goes through here; saving a job on any replica persists
//! it, and the leading replica's wheel picks it up.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CronError;
use crate::job::Job;
use crate::master::JobService;
use crate::metrics::Metrics;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<JobService>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: ApiState) -> Router {
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/jobs/",
            get(list_jobs).post(save_job).put(save_job),
        )
        .route("/jobs/:name", get(get_job).delete(delete_job))
        .route("/jobs/:name/history", get(job_history))
        .route("/metrics", get(metrics_exposition))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the token fires, then drain.
pub async fn run(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let app = router(state);
    tracing::info!(addr = %addr, "starting HTTP API server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CronError::Internal(format!("failed to bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| CronError::Internal(e.to_string()))
}

struct ApiError(CronError);

impl From<CronError> for ApiError {
    fn from(e: CronError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CronError::InvalidJob(_) | CronError::InvalidCronExpr { .. } => {
                StatusCode::BAD_REQUEST
            }
            CronError::JobNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn list_jobs(State(state): State<ApiState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.jobs.list().await?))
}

async fn save_job(
    State(state): State<ApiState>,
    Json(job): Json<Job>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.save(job).await?))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.get(&name).await?))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.jobs.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HistoryQuery {
    page: Option<usize>,
    #[serde(rename = "pageSize")]
    page_size: Option<usize>,
}

async fn job_history(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<crate::job::ExecutionRecord>>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    Ok(Json(state.jobs.list_history(&name, page, page_size).await?))
}

async fn metrics_exposition(State(state): State<ApiState>) -> Result<String, ApiError> {
    Ok(state.metrics.gather()?)
}
