use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::Error;
use crate::service::{EngineQueue, TestRunSpec};

#[derive(Deserialize)]
struct QueueTestsRequest {
    specs: Vec<TestRunSpec>,
}

#[derive(Serialize)]
struct QueueTestsResponse {
    job_ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct QueueOneResponse {
    job_id: Uuid,
}

#[derive(Serialize)]
struct CancelResponse {
    success: bool,
}

#[derive(Serialize)]
struct ReportResponse {
    filename: String,
    status: Option<String>,
    generated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    let code = match &err {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::JobNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub fn router(queue: Arc<EngineQueue>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/projects/:project_id/tests", post(queue_tests_handler))
        .route(
            "/api/projects/:project_id/dataset",
            post(queue_dataset_handler),
        )
        .route("/api/projects/:project_id/model", post(queue_model_handler))
        .route("/api/projects/:project_id/jobs", get(project_jobs_handler))
        .route("/api/projects/:project_id/report", get(report_handler))
        .route("/api/jobs/:job_id", get(job_handler))
        .route("/api/jobs/:job_id/cancel", post(cancel_handler))
        .route("/api/events", get(events_handler))
        .layer(cors)
        .with_state(queue)
}

/// Serve the facade until the process exits. Bind and serve failures are
/// logged, not propagated; the queue itself keeps running.
pub async fn run_api(addr: SocketAddr, queue: Arc<EngineQueue>) {
    let app = router(queue);
    tracing::info!(addr = %addr, "Starting submission API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind submission API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Submission API server failed");
    }
}

async fn queue_tests_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(project_id): Path<String>,
    Json(payload): Json<QueueTestsRequest>,
) -> impl IntoResponse {
    match queue.queue_tests(&project_id, &payload.specs).await {
        Ok(job_ids) => (StatusCode::OK, Json(QueueTestsResponse { job_ids })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn queue_dataset_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(project_id): Path<String>,
    Json(spec): Json<TestRunSpec>,
) -> impl IntoResponse {
    match queue.queue_dataset(&project_id, &spec).await {
        Ok(job_id) => (StatusCode::OK, Json(QueueOneResponse { job_id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn queue_model_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(project_id): Path<String>,
    Json(spec): Json<TestRunSpec>,
) -> impl IntoResponse {
    match queue.queue_model(&project_id, &spec).await {
        Ok(job_id) => (StatusCode::OK, Json(QueueOneResponse { job_id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn cancel_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    match queue.cancel_test_run(job_id).await {
        Ok(()) => (StatusCode::OK, Json(CancelResponse { success: true })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn job_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    match queue.job(job_id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn project_jobs_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    match queue.project_jobs(&project_id).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn report_handler(
    State(queue): State<Arc<EngineQueue>>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    let report = queue.report_for(&project_id).await;
    Json(ReportResponse {
        filename: queue.get_report_filename(&project_id),
        status: report.as_ref().map(|r| r.status.to_string()),
        generated_at: report.as_ref().map(|r| r.generated_at),
    })
}

async fn events_handler(State(queue): State<Arc<EngineQueue>>) -> impl IntoResponse {
    let stream = BroadcastStream::new(queue.subscribe()).filter_map(|item| match item {
        Ok(event) => Event::default().json_data(&event).ok().map(Ok::<_, Error>),
        // Lagged: the subscriber reconciles by polling the job endpoints.
        Err(BroadcastStreamRecvError::Lagged(_)) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
