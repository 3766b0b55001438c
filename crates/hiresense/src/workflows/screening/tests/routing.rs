use super::common::*;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

use crate::workflows::screening::router::{status_handler, submit_handler};
use crate::workflows::screening::{
    screening_router, DocumentPayload, FailureKind, RunStatus, ScreeningPayload, StageRole,
};

fn payload(filenames: &[&str]) -> ScreeningPayload {
    let engine = base64::engine::general_purpose::STANDARD;
    ScreeningPayload {
        job_title: "Data Engineer".to_string(),
        job_description: "Python, SQL, and pipeline ownership.".to_string(),
        documents: filenames
            .iter()
            .map(|name| DocumentPayload {
                filename: name.to_string(),
                content_base64: engine.encode(format!("%PDF-1.4 {name}")),
            })
            .collect(),
        top_n: None,
    }
}

fn post_json(body: &impl serde::Serialize) -> Request<Body> {
    Request::post("/api/v1/screenings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("serialize body")))
        .expect("request builds")
}

#[tokio::test]
async fn submit_route_returns_ranked_candidates() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let (service, _) = kit.service();
    let router = screening_router(Arc::new(service));

    let mut body = payload(&["a.pdf", "b.pdf", "c.pdf"]);
    body.top_n = Some(2);
    let response = router
        .oneshot(post_json(&body))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert!(payload["run_id"].as_str().is_some());
    let candidates = payload["candidates"].as_array().expect("candidates array");
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0]["candidate"], "a.pdf");
    assert_eq!(candidates[0]["rank"], 1);
    assert_eq!(candidates[1]["candidate"], "c.pdf");
}

#[tokio::test]
async fn run_record_is_served_after_submission() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let (service, _) = kit.service();
    let router = screening_router(Arc::new(service));

    let response = router
        .clone()
        .oneshot(post_json(&payload(&["a.pdf"])))
        .await
        .expect("submit executes");
    let run_id = read_json_body(response).await["run_id"]
        .as_str()
        .expect("run id")
        .to_string();

    let response = router
        .oneshot(
            Request::get(format!("/api/v1/screenings/{run_id}"))
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("status executes");

    assert_eq!(response.status(), StatusCode::OK);
    let record = read_json_body(response).await;
    assert_eq!(record["status"], "aggregated");
    assert_eq!(record["stage_log"].as_array().map(Vec::len), Some(4));
}

#[tokio::test]
async fn invalid_base64_is_unprocessable() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let (service, repository) = kit.service();
    let router = screening_router(Arc::new(service));

    let body = json!({
        "job_title": "Data Engineer",
        "job_description": "Python",
        "documents": [{ "filename": "a.pdf", "content_base64": "***not base64***" }],
    });
    let response = router.oneshot(post_json(&body)).await.expect("route executes");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let payload = read_json_body(response).await;
    assert!(payload["error"]
        .as_str()
        .is_some_and(|message| message.contains("a.pdf")));
    assert!(repository.all().is_empty(), "no run is started");
}

#[tokio::test]
async fn submit_handler_rejects_missing_documents() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let (service, _) = kit.service();

    let response =
        submit_handler::<MemoryRunRepository>(State(Arc::new(service)), axum::Json(payload(&[])))
            .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let payload = read_json_body(response).await;
    assert_eq!(payload["kind"], "workspace_setup");
}

#[tokio::test]
async fn stage_failure_is_bad_gateway_with_diagnostics() {
    let kit = StageKit::new().stage(
        "cv_grader",
        StageRole::Grading,
        "cv_grading_results.csv",
        &failing(1, "model load failed"),
    );
    let (service, _) = kit.service();

    let response = submit_handler::<MemoryRunRepository>(
        State(Arc::new(service)),
        axum::Json(payload(&["a.pdf"])),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let failure: Value = read_json_body(response).await;
    assert_eq!(failure["kind"], "stage_execution");
    assert_eq!(failure["stage"], "cv_grader");
    assert_eq!(
        failure["stderr"].as_str().map(str::trim),
        Some("model load failed")
    );
}

#[tokio::test]
async fn aggregation_failure_is_internal_error() {
    let kit = StageKit::new().stage(
        "cv_grader",
        StageRole::Grading,
        "cv_grading_results.csv",
        "exit 0\n",
    );
    let (service, _) = kit.service();

    let response = submit_handler::<MemoryRunRepository>(
        State(Arc::new(service)),
        axum::Json(payload(&["a.pdf"])),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json_body(response).await["kind"], "aggregation");
}

#[tokio::test]
async fn status_handler_returns_not_found_for_unknown_runs() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let (service, _) = kit.service();

    let response = status_handler::<MemoryRunRepository>(
        State(Arc::new(service)),
        axum::extract::Path("unknown-run".to_string()),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json_body(response).await["run_id"], "unknown-run");
}

#[tokio::test]
async fn status_handler_reports_repository_outage() {
    let kit = scenario_kit(SCENARIO_PERSONA, SCENARIO_BIAS);
    let service = kit.service_with(Arc::new(UnavailableRunRepository));

    let response = status_handler::<UnavailableRunRepository>(
        State(Arc::new(service)),
        axum::extract::Path("any".to_string()),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn dropping_the_request_cancels_the_run() {
    let markers = tempfile::tempdir().expect("marker dir");
    let marker = markers.path().join("feedback-ran");
    let kit = StageKit::new()
        .stage(
            "cv_grader",
            StageRole::Grading,
            "cv_grading_results.csv",
            "sleep 4\ntrue\n",
        )
        .stage(
            "feedback_agent",
            StageRole::Feedback,
            "feedback_adjusted_results.csv",
            &touches(&marker),
        );
    let (service, repository) = kit.service();
    let router = screening_router(Arc::new(service));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(300),
        router.oneshot(post_json(&payload(&["a.pdf"]))),
    )
    .await;
    assert!(abandoned.is_err(), "request should still be running");

    let deadline = Instant::now() + Duration::from_secs(3);
    let record = loop {
        let failed = repository
            .all()
            .into_iter()
            .find(|record| record.status == RunStatus::Failed);
        if let Some(record) = failed {
            break record;
        }
        assert!(
            Instant::now() < deadline,
            "run kept going after the request was dropped"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(
        record.failure.expect("failure recorded").kind,
        FailureKind::Cancelled
    );
    assert!(!marker.exists());
    assert_eq!(kit.leftover_workspaces(), 0);
}
