use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use stream_scheduler::{
    config::Config,
    database::Database,
    storage::MediaStorage,
    streaming::StreamManager,
    web::{create_router, AppState},
};

const BOUNDARY: &str = "----stream-scheduler-test-boundary";

async fn test_app() -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.database.url = format!("sqlite://{}", dir.path().join("api.db").display());
    config.storage.uploads_path = dir.path().join("uploads");
    config.storage.staging_path = dir.path().join("staging");
    // Nothing in these tests launches an encoder
    config.streaming.ffmpeg_command = "/nonexistent/ffmpeg".to_string();

    let database = Database::new(&config.database).await.unwrap();
    database.migrate().await.unwrap();
    let storage = MediaStorage::from_config(&config.storage);
    storage.ensure_storage_dirs().await.unwrap();
    let manager = StreamManager::new(
        Arc::new(database.clone()),
        storage.clone(),
        (&config.streaming).into(),
    );

    let app = create_router(AppState {
        database,
        config,
        manager,
        storage,
    });
    (dir, app)
}

// Helper function to send requests to the app
async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request_builder = Request::builder().method(method).uri(uri);

    let request = if let Some(body) = body {
        request_builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    read_response(app, request).await
}

async fn read_response(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

/// Build a multipart start submission. `video` is `(file name, contents)`.
fn start_form(fields: &[(&str, &str)], video: Option<(&str, &[u8])>) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, contents)) = video {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/streams/start")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn scheduled_fields(stream_key: &str, start: &str) -> Vec<(String, String)> {
    [
        ("title", "Evening show"),
        ("stream_key", stream_key),
        ("rtmp_url", "rtmp://live.example.com/app"),
        ("bitrate", "2500"),
        ("fps", "30"),
        ("resolution", "1280x720"),
        ("loop", "true"),
        ("schedule_enabled", "1"),
        ("schedule_start_enabled", "1"),
        ("schedule_start", start),
        ("schedule_duration_enabled", "1"),
        ("schedule_duration", "45"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn as_refs(fields: &[(String, String)]) -> Vec<(&str, &str)> {
    fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, app) = test_app().await;

    let (status, response) = send_request(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "healthy");
    assert_eq!(response["database"], "healthy");
    assert_eq!(response["active_streams"], 0);
    assert!(response.get("timestamp").is_some());
}

#[tokio::test]
async fn test_empty_registry_views() {
    let (_dir, app) = test_app().await;

    let (status, active) = send_request(&app, Method::GET, "/api/v1/streams/active", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active, json!([]));

    let (status, scheduled) =
        send_request(&app, Method::GET, "/api/v1/streams/scheduled", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scheduled, json!([]));

    let (status, history) = send_request(&app, Method::GET, "/api/v1/streams", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, json!([]));
}

#[tokio::test]
async fn test_stop_unknown_stream_is_not_found() {
    let (_dir, app) = test_app().await;

    let (status, response) = send_request(
        &app,
        Method::POST,
        "/api/v1/streams/stop",
        Some(json!({ "stream_key": "nobody" })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "not_found");

    let (status, _) = send_request(
        &app,
        Method::POST,
        "/api/v1/streams/nobody/cancel-schedule",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_of_unknown_stream() {
    let (_dir, app) = test_app().await;

    let request = Request::builder()
        .uri("/api/v1/streams/nobody/status")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    let event: Value = serde_json::from_str(data).unwrap();
    assert_eq!(event["event"], "not_streaming");
    assert_eq!(event["is_streaming"], false);
}

#[tokio::test]
async fn test_start_without_video_is_rejected() {
    let (_dir, app) = test_app().await;

    let (status, response) = read_response(
        &app,
        start_form(
            &[
                ("title", "No video"),
                ("stream_key", "k1"),
                ("rtmp_url", "rtmp://live.example.com/app"),
                ("bitrate", "2500"),
                ("resolution", "1280x720"),
            ],
            None,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "validation");
    assert_eq!(response["message"], "Video file not found");
}

#[tokio::test]
async fn test_malformed_form_discards_staged_video() {
    let (dir, app) = test_app().await;

    let (status, response) = read_response(
        &app,
        start_form(
            &[("stream_key", "k1"), ("bitrate", "fast"), ("resolution", "1280x720")],
            Some(("clip.mp4", b"fake video")),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "validation");
    assert_eq!(
        std::fs::read_dir(dir.path().join("staging")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_schedule_conflict_cancel_and_history() {
    let (dir, app) = test_app().await;
    let start = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
    let fields = scheduled_fields("evening", &start);

    let (status, response) = read_response(
        &app,
        start_form(&as_refs(&fields), Some(("show.mp4", b"fake video"))),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{response}");
    assert_eq!(response["scheduled"], true);
    assert_eq!(response["duration"], 45 * 60);

    let (_, scheduled) = send_request(&app, Method::GET, "/api/v1/streams/scheduled", None).await;
    assert_eq!(scheduled.as_array().unwrap().len(), 1);
    assert_eq!(scheduled[0]["stream_key"], "evening");

    let (status, response) = read_response(
        &app,
        start_form(&as_refs(&fields), Some(("other.mp4", b"fake video"))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"], "conflict");

    let (status, response) = send_request(
        &app,
        Method::POST,
        "/api/v1/streams/evening/cancel-schedule",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);

    let (_, history) = send_request(&app, Method::GET, "/api/v1/streams", None).await;
    let records = history.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["is_streaming"], false);
    assert_eq!(records[0]["status"], "stopped");
    assert_eq!(
        std::fs::read_dir(dir.path().join("uploads")).unwrap().count(),
        0
    );

    let id = records[0]["id"].as_i64().unwrap();
    let uri = format!("/api/v1/streams/history/{id}");
    let (status, _) = send_request(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, response) = send_request(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"], "not_found");
}
