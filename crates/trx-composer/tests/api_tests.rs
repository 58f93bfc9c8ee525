//! HTTP surface tests against the in-memory stores.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use trx_composer::{create_router, ComposerConfig, ComposerService};
use trx_queue::MemoryQueueStore;
use trx_store::MemoryClaimStore;

fn app_with_config(config: ComposerConfig) -> Router {
    let service = ComposerService::with_stores(
        config,
        Arc::new(MemoryClaimStore::new()),
        Arc::new(MemoryQueueStore::new()),
    );
    create_router(service.state(), None)
}

fn app() -> Router {
    app_with_config(ComposerConfig::default())
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn task_body() -> Value {
    json!({
        "source": { "url": "https://cdn.example.com/movie.mp4" },
        "encoder": "cpu",
        "duration": 120.5,
        "file_size": 1048576
    })
}

async fn create(app: &Router) -> String {
    let (status, body) = send(app, Method::POST, "/v1/tasks", Some(task_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_ready_with_memory_stores() {
    let (status, body) = send(&app(), Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_submit_and_get_task() {
    let app = app();
    let id = create(&app).await;

    let (status, body) = send(&app, Method::GET, &format!("/v1/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["duration"], 120.5);

    let (status, body) = send(&app, Method::GET, &format!("/v1/tasks/{id}/progress"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"], 0);
}

#[tokio::test]
async fn test_submit_rejects_invalid_forms() {
    let app = app();

    let mut zero_duration = task_body();
    zero_duration["duration"] = json!(0.0);
    let (status, body) = send(&app, Method::POST, "/v1/tasks", Some(zero_duration)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());

    let mut no_source = task_body();
    no_source["source"] = json!({});
    let (status, _) = send(&app, Method::POST, "/v1/tasks", Some(no_source)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let app = app();
    let (status, _) = send(&app, Method::GET, &format!("/v1/tasks/{}", uuid::Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::GET, "/v1/tasks/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_then_delete() {
    let app = app();
    let id = create(&app).await;

    let (status, body) = send(&app, Method::POST, &format!("/v1/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");

    let (status, _) = send(&app, Method::DELETE, &format!("/v1/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, &format!("/v1/tasks/{id}"), None).await;
    assert_eq!(body["status"], "canceled");
    assert!(body["deleted_at"].is_string());
}

#[tokio::test]
async fn test_dispatch_on_empty_queue() {
    let app = app();
    let request = json!({ "hostname": "worker-1", "worker_id": "w1", "routing": "cpu" });
    let (status, body) = send(&app, Method::POST, "/internal/v1/dispatch/next", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "no_tasks" }));

    let request = json!({ "hostname": "worker-1", "worker_id": "w1", "routing": "" });
    let (status, _) = send(&app, Method::POST, "/internal/v1/dispatch/next", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_completion_part_out_of_range() {
    let app = app();
    let id = create(&app).await;
    let report = json!({ "task_id": id, "part": 4, "parts_total": 4 });
    let (status, _) = send(&app, Method::POST, "/internal/v1/completions", Some(report)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_and_chunk_guards() {
    let work = tempfile::tempdir().unwrap();
    let config = ComposerConfig {
        work_dir: work.path().to_path_buf(),
        ..ComposerConfig::default()
    };
    let app = app_with_config(config);
    let id = create(&app).await;

    // Path escapes are refused
    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/v1/chunks?task_id={id}&path=../../etc/passwd"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Served from the task directory
    let chunks = work.path().join(&id).join("chunks");
    tokio::fs::create_dir_all(&chunks).await.unwrap();
    tokio::fs::write(chunks.join("chunk_000.mp4"), b"chunk-bytes").await.unwrap();
    let request = Request::builder()
        .uri(format!("/v1/chunks?task_id={id}&path=chunks/chunk_000.mp4"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"chunk-bytes");

    // Upload lands in encoded/
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/v1/tasks/{id}/parts/0/part_00000.mp4"))
        .body(Body::from("encoded-bytes"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let stored = tokio::fs::read(work.path().join(&id).join("encoded/part_00000.mp4")).await.unwrap();
    assert_eq!(stored, b"encoded-bytes");

    // Once canceled, uploads are refused
    send(&app, Method::POST, &format!("/v1/tasks/{id}/cancel"), None).await;
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/v1/tasks/{id}/parts/1/part_00001.mp4"))
        .body(Body::from("late"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}
