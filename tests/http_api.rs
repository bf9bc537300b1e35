//! HTTP contract tests, driven through the router with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use scanq::http::router;
use scanq_tasks::check::demo::{EchoModule, MultiplyModule};
use scanq_tasks::queue::memory::InMemoryQueue;
use scanq_tasks::store::memory::InMemoryTaskStore;
use scanq_tasks::{JobService, ModuleRegistry, PoolHandle, WorkerConfig};

fn service() -> JobService {
    let mut registry = ModuleRegistry::new();
    registry
        .register(EchoModule)
        .register(MultiplyModule::with_tick(Duration::from_millis(1)));
    JobService::new(
        Arc::new(InMemoryTaskStore::default()),
        Arc::new(InMemoryQueue::default()),
        Arc::new(registry),
    )
}

fn start_workers(service: &JobService) -> PoolHandle {
    service
        .worker_pool(WorkerConfig {
            workers: 2,
            reap_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        })
        .start()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn submit(app: &Router, modules: Value) -> String {
    let (status, body) = post_json(app, "/jobs", json!({ "modules": modules })).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    body["task_id"].as_str().unwrap().to_string()
}

async fn poll_until_terminal(app: &Router, task_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = get(app, &format!("/jobs/{task_id}")).await;
            assert_eq!(status, StatusCode::OK);
            if body["state"] == "SUCCESS" || body["state"] == "FAILURE" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

#[tokio::test]
async fn health_is_ok() {
    let app = router(service());
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn submit_then_poll_pending() {
    let app = router(service());
    let (status, body) = post_json(
        &app,
        "/jobs",
        json!({ "modules": [{ "module": "echo", "params": { "target": "example.test" } }] }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "started");
    let task_id = body["task_id"].as_str().unwrap();

    let (status, body) = get(&app, &format!("/jobs/{task_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "task_id": task_id, "state": "PENDING" }));

    let (status, body) = get(&app, &format!("/jobs/{task_id}/result")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "PENDING");
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let app = router(service());

    let (status, body) = post_json(&app, "/jobs", json!({ "modules": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_spec");

    let (status, body) =
        post_json(&app, "/jobs", json!({ "modules": [{ "module": "sqli" }] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("sqli"));

    let (status, _) = post_json(
        &app,
        "/jobs",
        json!({ "modules": [{ "module": "multiply", "params": { "x": 1 } }] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(&app, "/jobs", json!({ "jobs": "nope" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (_, stats) = get(&app, "/jobs/stats").await;
    assert_eq!(stats["tasks"]["submitted"], 0);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let app = router(service());
    for uri in ["/jobs/missing", "/jobs/missing/result"] {
        let (status, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
    let (status, _) = post_json(&app, "/jobs/missing/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn multiply_runs_to_success() {
    let service = service();
    let workers = start_workers(&service);
    let app = router(service);

    let task_id = submit(
        &app,
        json!([
            { "module": "echo", "params": { "target": "example.test" } },
            { "module": "multiply", "params": { "x": 6, "y": 7, "sleep_seconds": 2 }, "weight": 3.0 },
        ]),
    )
    .await;

    let body = poll_until_terminal(&app, &task_id).await;
    assert_eq!(body["state"], "SUCCESS");
    assert_eq!(body["result"]["echo"], json!({ "target": "example.test" }));
    assert_eq!(body["result"]["multiply"]["result"], 42);
    assert!(body.get("info").is_none());

    let (status, body) = get(&app, &format!("/jobs/{task_id}/result")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["result"]["multiply"]["message"],
        "Successfully multiplied 6 * 7 = 42"
    );

    workers.shutdown().await;
    let (_, stats) = get(&app, "/jobs/stats").await;
    assert_eq!(stats["tasks"]["succeeded"], 1);
    assert_eq!(stats["queue"], json!({ "ready": 0, "in_flight": 0 }));
}

#[tokio::test]
async fn failed_result_is_409() {
    let service = service();
    let workers = start_workers(&service);
    let app = router(service);

    // Passes validation, overflows at run time.
    let task_id = submit(
        &app,
        json!([{ "module": "multiply", "params": { "x": i64::MAX, "y": 2, "sleep_seconds": 0 } }]),
    )
    .await;

    let body = poll_until_terminal(&app, &task_id).await;
    assert_eq!(body["state"], "FAILURE");
    assert_eq!(body["info"]["failing_module"], "multiply");
    assert_eq!(body["info"]["reason"], "module_error");

    let (status, body) = get(&app, &format!("/jobs/{task_id}/result")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "task_failed");
    assert_eq!(body["info"]["failing_module"], "multiply");

    workers.shutdown().await;
}

#[tokio::test]
async fn cancel_pending_job() {
    let app = router(service());
    let task_id = submit(&app, json!([{ "module": "echo" }])).await;

    let (status, body) = post_json(&app, &format!("/jobs/{task_id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "FAILURE");
    assert_eq!(body["info"]["reason"], "cancelled");
    assert_eq!(body["info"]["error_detail"], "Scan cancelled by user");

    let (status, body) = post_json(&app, &format!("/jobs/{task_id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}
