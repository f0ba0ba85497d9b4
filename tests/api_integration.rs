//! End-to-end HTTP tests driving the full router (spec.md §6), exercised
//! through `tower::ServiceExt::oneshot` rather than a bound TCP listener.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use loyalty_ledger::api::{self, AppState};
use loyalty_ledger::clock::SystemClock;
use loyalty_ledger::config::AppConfig;
use loyalty_ledger::db::Db;
use loyalty_ledger::ids::UuidGenerator;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> axum::Router {
    let state = AppState {
        db: Db::open_in_memory().unwrap(),
        clock: Arc::new(SystemClock),
        ids: Arc::new(UuidGenerator),
        config: Arc::new(AppConfig::default()),
    };
    api::router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn posting_a_receipt_without_tenant_header_is_rejected() {
    let payload = json!({
        "merchant_id": "m1",
        "account_ref": "cust-1",
        "program_id": "prog",
        "grand_total_cents": 1000,
        "issued_at": "2026-01-01T00:00:00Z",
    });
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/receipts")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn posting_the_same_receipt_twice_returns_409_on_the_second_call() {
    let app = app();
    let payload = json!({
        "idempotency_key": "idem-1",
        "merchant_id": "m1",
        "store_id": "s1",
        "account_ref": "cust-1",
        "program_id": "prog",
        "grand_total_cents": 1999,
        "processor_txn_id": "txn-1",
        "issued_at": "2026-01-01T00:00:00Z",
        "items": [],
    });

    let request = |app: &axum::Router| {
        app.clone().oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/receipts")
                .header("content-type", "application/json")
                .header("x-tenant-id", "t1")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
    };

    let first = request(&app).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_body = body_json(first).await;
    let job_id = first_body["processing_job_id"].as_str().unwrap().to_string();

    let second = request(&app).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let second_body = body_json(second).await;
    assert_eq!(second_body["processing_job_id"], job_id);

    let status_response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v1/receipts/{}/status", first_body["receipt_id"].as_str().unwrap()))
                .header("x-tenant-id", "t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status_response.status(), StatusCode::OK);
    let status_body = body_json(status_response).await;
    assert_eq!(status_body["status"], "queued");
}

#[tokio::test]
async fn getting_receipt_status_for_an_unknown_id_returns_404() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/v1/receipts/does-not-exist/status")
                .header("x-tenant-id", "t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn program_config_round_trips_through_put_and_get() {
    let app = app();
    let config = json!({"earnRatePerCent": "0.01"});

    let put_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v1/programs/prog-1/config")
                .header("content-type", "application/json")
                .header("x-tenant-id", "t1")
                .body(Body::from(config.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(put_response.status(), StatusCode::NO_CONTENT);

    let get_response = app
        .oneshot(
            Request::builder()
                .uri("/v1/programs/prog-1/config")
                .header("x-tenant-id", "t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let body = body_json(get_response).await;
    assert_eq!(body["config"]["earnRatePerCent"], "0.01");
}

#[tokio::test]
async fn getting_program_config_for_an_unconfigured_program_returns_404() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/v1/programs/unconfigured/config")
                .header("x-tenant-id", "t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
