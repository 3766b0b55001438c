use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::domain::{CandidateDocument, JobPosting, RunId};
use super::pipeline::CancellationFlag;
use super::ranking::RankedCandidate;
use super::repository::{RepositoryError, RunRepository};
use super::service::{FailureKind, RunError, ScreeningRequest, ScreeningService};

/// JSON body accepted by `POST /api/v1/screenings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningPayload {
    pub job_title: String,
    pub job_description: String,
    pub documents: Vec<DocumentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub filename: String,
    pub content_base64: String,
}

impl ScreeningPayload {
    fn into_request(self) -> Result<ScreeningRequest, String> {
        let engine = base64::engine::general_purpose::STANDARD;
        let documents = self
            .documents
            .into_iter()
            .map(|document| {
                engine
                    .decode(document.content_base64.trim())
                    .map(|content| CandidateDocument::new(document.filename.clone(), content))
                    .map_err(|err| {
                        format!("document `{}` is not valid base64: {err}", document.filename)
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScreeningRequest {
            job: JobPosting {
                title: self.job_title,
                description: self.job_description,
            },
            documents,
            top_n: self.top_n,
        })
    }
}

#[derive(Debug, Serialize)]
struct ScreeningResponse {
    run_id: RunId,
    candidates: Vec<RankedCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_to: Option<String>,
}

/// Router exposing run submission and run history.
pub fn screening_router<R>(service: Arc<ScreeningService<R>>) -> Router
where
    R: RunRepository + 'static,
{
    Router::new()
        .route("/api/v1/screenings", post(submit_handler::<R>))
        .route("/api/v1/screenings/:run_id", get(status_handler::<R>))
        .with_state(service)
}

pub(crate) async fn submit_handler<R>(
    State(service): State<Arc<ScreeningService<R>>>,
    axum::Json(payload): axum::Json<ScreeningPayload>,
) -> Response
where
    R: RunRepository + 'static,
{
    let request = match payload.into_request() {
        Ok(request) => request,
        Err(message) => {
            let payload = json!({ "error": message });
            return (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)).into_response();
        }
    };

    // Stage processes block until they exit. If the client goes away first the handler
    // future is dropped, which cancels the run.
    let cancel = CancellationFlag::new();
    let _cancel_on_drop = CancelOnDrop(cancel.clone());
    let outcome =
        tokio::task::spawn_blocking(move || service.run_with_cancellation(request, &cancel)).await;

    match outcome {
        Ok(Ok(outcome)) => {
            let body = ScreeningResponse {
                run_id: outcome.run_id,
                candidates: outcome.ranked,
                published_to: outcome
                    .published_to
                    .map(|path| path.display().to_string()),
            };
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Ok(Err(err)) => run_error_response(&err),
        Err(join_error) => {
            let payload = json!({
                "error": format!("screening run aborted: {join_error}"),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

/// Cancels the run it guards when dropped.
struct CancelOnDrop(CancellationFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub(crate) async fn status_handler<R>(
    State(service): State<Arc<ScreeningService<R>>>,
    Path(run_id): Path<String>,
) -> Response
where
    R: RunRepository + 'static,
{
    let id = RunId(run_id);
    match service.get(&id) {
        Ok(record) => (StatusCode::OK, axum::Json(record)).into_response(),
        Err(RepositoryError::NotFound) => {
            let payload = json!({
                "run_id": id.0,
                "error": "run not found",
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(other) => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) fn run_error_response(err: &RunError) -> Response {
    let status = if err.is_invalid_input() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        match err.kind() {
            FailureKind::StageExecution | FailureKind::Cancelled => StatusCode::BAD_GATEWAY,
            FailureKind::WorkspaceSetup | FailureKind::Aggregation => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    };
    (status, axum::Json(err.failure())).into_response()
}
