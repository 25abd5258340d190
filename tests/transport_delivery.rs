//! Delivery against a mock receiver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use reportwire::transport::{
    Dispatcher, FileDropConfig, RestConfig, RetryToken, SendRequest, TransportConfig,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Clone, Default)]
struct Received(Arc<Mutex<Vec<(String, String, String)>>>);

impl Received {
    fn all(&self) -> Vec<(String, String, String)> {
        self.0.lock().unwrap().clone()
    }
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn accept(State(received): State<Received>, headers: HeaderMap, body: String) -> StatusCode {
    received.0.lock().unwrap().push((
        header(&headers, "x-report-id"),
        header(&headers, "content-type"),
        body,
    ));
    StatusCode::OK
}

async fn partial() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"rejectedItems": [1]})))
}

async fn invalid() -> impl IntoResponse {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"failures": [{"index": 0, "reason": "missing PID-3"}]})),
    )
}

async fn down() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(2)).await;
    StatusCode::OK
}

async fn serve(received: Received) -> String {
    let router = Router::new()
        .route("/accept", post(accept))
        .route("/partial", post(partial))
        .route("/invalid", post(invalid))
        .route("/down", post(down))
        .route("/slow", post(slow))
        .with_state(received);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn rest(url: String) -> TransportConfig {
    TransportConfig::Rest(RestConfig {
        url,
        headers: Default::default(),
    })
}

fn request<'a>(report_id: Uuid, content: &'a str, item_count: usize) -> SendRequest<'a> {
    SendRequest {
        report_id,
        receiver: "co-phd.elr",
        content,
        content_type: "application/hl7-v2",
        item_count,
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_rest_outcomes() {
    let received = Received::default();
    let base = serve(received.clone()).await;
    let dispatcher = Dispatcher::new("nats://127.0.0.1:1");
    let id = Uuid::new_v4();

    let token = dispatcher
        .send(&rest(format!("{base}/accept")), &request(id, "MSH|x", 1), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::None);
    assert_eq!(
        received.all(),
        vec![(id.to_string(), "application/hl7-v2".to_string(), "MSH|x".to_string())]
    );

    let token = dispatcher
        .send(&rest(format!("{base}/partial")), &request(id, "batch", 3), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::Items([1].into()));

    let token = dispatcher
        .send(&rest(format!("{base}/invalid")), &request(id, "batch", 3), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::Items([0].into()));

    // A rejection naming every item is a full failure.
    let token = dispatcher
        .send(&rest(format!("{base}/invalid")), &request(id, "single", 1), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::AllItems);

    let token = dispatcher
        .send(&rest(format!("{base}/down")), &request(id, "batch", 3), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::AllItems);
}

#[tokio::test]
async fn test_timeouts_and_refused_connections_retry_everything() {
    let base = serve(Received::default()).await;
    let dispatcher = Dispatcher::new("nats://127.0.0.1:1");
    let id = Uuid::new_v4();

    let token = dispatcher
        .send(
            &rest(format!("{base}/slow")),
            &request(id, "x", 2),
            Duration::from_millis(100),
        )
        .await;
    assert_eq!(token, RetryToken::AllItems);

    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let token = dispatcher
        .send(&rest(format!("http://{closed}/accept")), &request(id, "x", 2), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::AllItems);
}

#[tokio::test]
async fn test_file_drop_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new("nats://127.0.0.1:1");
    let id = Uuid::new_v4();
    let config = TransportConfig::FileDrop(FileDropConfig {
        directory: dir.path().to_path_buf(),
    });

    let token = dispatcher
        .send(&config, &request(id, "MSH|^~\\&|LAB", 1), TIMEOUT)
        .await;
    assert_eq!(token, RetryToken::None);

    let written = std::fs::read_to_string(dir.path().join(format!("{id}.hl7"))).unwrap();
    assert_eq!(written, "MSH|^~\\&|LAB");
}
