//! Integration tests for the query surface: event listing with filters,
//! paging, and sorting; stats; hosts; and config validation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kwatch_core::{AnomalyType, Event};
use kwatch_server::app::{build_router, App};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn seeded_app() -> (TempDir, Arc<App>, axum::Router) {
    let dir = TempDir::new().unwrap();
    let app = App::new(
        dir.path().join("data"),
        dir.path().join("config.json"),
        None,
    )
    .unwrap();

    let seed = [
        (AnomalyType::KernelPanic, "host-a", "2026-01-01T10:00:00Z", "Kernel panic - not syncing"),
        (AnomalyType::Oom, "host-a", "2026-01-02T10:00:00Z", "Out of memory: Killed process 1"),
        (AnomalyType::Oom, "host-b", "2026-01-03T10:00:00Z", "Out of memory: Killed process 2"),
        (AnomalyType::FsError, "host-b", "2026-01-04T10:00:00Z", "EXT4-fs error on sda1"),
        (AnomalyType::Oops, "host-c", "2026-01-05T10:00:00Z", "Oops: 0002 [#1] SMP"),
    ];
    for (i, (t, host, ts, msg)) in seed.iter().enumerate() {
        let ev = Event::from_detection(*t, msg, "/var/log/kern.log", i as u64 + 1, ts, host);
        app.store.append(&ev).unwrap();
    }

    let router = build_router(Arc::clone(&app), None);
    (dir, app, router)
}

async fn get(router: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn put_config(router: &axum::Router, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PUT")
        .uri("/api/v1/config")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_list_default_sort_and_paging() {
    let (_dir, _app, router) = seeded_app();
    let (status, body) = get(&router, "/api/v1/events?size=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["page"], 1);
    assert_eq!(body["size"], 2);
    assert_eq!(body["has_next"], true);

    // detected_at:desc by default — newest first.
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["detected_at"], "2026-01-05T10:00:00Z");
    assert_eq!(items[1]["detected_at"], "2026-01-04T10:00:00Z");

    let (_, last_page) = get(&router, "/api/v1/events?size=2&page=3").await;
    assert_eq!(last_page["items"].as_array().unwrap().len(), 1);
    assert_eq!(last_page["has_next"], false);
}

#[tokio::test]
async fn test_list_filters() {
    let (_dir, _app, router) = seeded_app();

    let (_, by_type) = get(&router, "/api/v1/events?types=oom,fs_error").await;
    assert_eq!(by_type["total"], 3);

    let (_, by_severity) = get(&router, "/api/v1/events?severity=critical&severity=minor").await;
    assert_eq!(by_severity["total"], 2);

    let (_, by_host) = get(&router, "/api/v1/events?host_id=host-b").await;
    assert_eq!(by_host["total"], 2);

    let (_, by_keyword) = get(&router, "/api/v1/events?keyword=EXT4").await;
    assert_eq!(by_keyword["total"], 1);

    let (_, by_range) = get(
        &router,
        "/api/v1/events?start=2026-01-02T00:00:00Z&end=2026-01-04T00:00:00Z",
    )
    .await;
    assert_eq!(by_range["total"], 2);
}

#[tokio::test]
async fn test_list_sort_ascending() {
    let (_dir, _app, router) = seeded_app();
    let (_, body) = get(&router, "/api/v1/events?sort=detected_at:asc&size=1").await;
    assert_eq!(
        body["items"][0]["detected_at"], "2026-01-01T10:00:00Z",
        "oldest first"
    );
}

#[tokio::test]
async fn test_list_rejects_malformed_dates() {
    let (_dir, _app, router) = seeded_app();
    let (status, body) = get(&router, "/api/v1/events?start=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");
    assert_eq!(body["details"]["param"], "start");

    let (status, body) = get(&router, "/api/v1/events?end=2026-13-99T00:00:00Z").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["param"], "end");
}

#[tokio::test]
async fn test_stats_shape_and_filters() {
    let (_dir, _app, router) = seeded_app();
    let (status, body) = get(&router, "/api/v1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_anomalies"], 5);
    assert_eq!(body["by_severity"]["critical"], 1);
    assert_eq!(body["by_severity"]["major"], 3);
    assert_eq!(body["by_severity"]["minor"], 1);
    assert_eq!(body["by_type"]["oom"], 2);
    assert_eq!(body["last_detection"], "2026-01-05T10:00:00Z");
    assert!(body["last_scan"].is_string());

    let (_, filtered) = get(&router, "/api/v1/stats?host_id=host-b").await;
    assert_eq!(filtered["total_anomalies"], 2);

    // All seeded events are far in the past; a 1-hour window sees none.
    let (_, windowed) = get(&router, "/api/v1/stats?window=PT1H").await;
    assert_eq!(windowed["total_anomalies"], 0);
    assert_eq!(windowed["by_severity"]["critical"], 0, "zero-filled");
}

#[tokio::test]
async fn test_hosts_distinct_sorted() {
    let (_dir, _app, router) = seeded_app();
    let (status, body) = get(&router, "/api/v1/hosts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(
        body["hosts"],
        json!(["host-a", "host-b", "host-c"])
    );
}

#[tokio::test]
async fn test_config_round_trip() {
    let (_dir, _app, router) = seeded_app();
    let (status, mut config) = get(&router, "/api/v1/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["detection"]["scan_interval_sec"], 60);

    config["detection"]["scan_interval_sec"] = json!(300);
    let (status, updated) = put_config(&router, config).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["detection"]["scan_interval_sec"], 300);

    let (_, fetched) = get(&router, "/api/v1/config").await;
    assert_eq!(fetched["detection"]["scan_interval_sec"], 300);
}

#[tokio::test]
async fn test_config_validation_leaves_stored_config_unchanged() {
    let (_dir, app, router) = seeded_app();
    let before = app.config.snapshot();

    let cases = [
        json!({ "detection": { "scan_interval_sec": 2 } }),
        json!({ "detection": { "retention_days": 400 } }),
        json!({ "detection": { "retention_max_events": 0 } }),
        json!({ "alerts": { "emails": ["not-an-email"] } }),
        json!({ "surprise": {} }),
        json!([1, 2, 3]),
    ];
    for body in cases {
        let (status, response) = put_config(&router, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case: {}", body);
        assert_eq!(response["code"], "INVALID_ARGUMENT");
    }

    assert_eq!(app.config.snapshot(), before, "stored config untouched");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, _app, router) = seeded_app();
    let (status, body) = get(&router, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage"]["event_count"], 5);
    assert_eq!(body["storage"]["writable"], true);
    assert_eq!(body["sse_clients"], 0);
}

#[tokio::test]
async fn test_report_artifact_surface() {
    let (_dir, app, router) = seeded_app();

    let (status, body) = get(&router, "/api/v1/report").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    std::fs::write(app.data_dir.join("report.md"), "# Analysis\n\nAll clear.\n").unwrap();
    let request = Request::builder()
        .uri("/api/v1/report")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/markdown"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("All clear"));
}
