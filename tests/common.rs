use axum::{body::Body, http::Request, response::Response, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;
use webcard::{
    assets::LogIndicator,
    http::{self, AppState},
    scheduler::Uptime,
    storage::MemoryStorage,
    telemetry::PlatformProbe,
    AppConfig, Device,
};

pub const TOKEN: &str = "s3cret";
pub const BOUNDARY: &str = "webcard-test-boundary";

pub struct FixedProbe;

impl PlatformProbe for FixedProbe {
    fn free_heap_bytes(&self) -> u64 {
        123_456
    }

    fn signal_dbm(&self) -> i32 {
        -58
    }
}

pub async fn app_with(
    storage: &MemoryStorage,
    max_upload_bytes: usize,
    send_timeout: Duration,
) -> Router {
    let mut config = AppConfig::for_storage("./unused");
    config.upload_token = Some(TOKEN.to_string());
    let indicator = Arc::new(LogIndicator);
    let device = Device::boot(Arc::new(storage.clone()), indicator.clone(), &config).await;
    http::router(
        AppState {
            device: Arc::new(Mutex::new(device)),
            uptime: Uptime::start(),
            probe: Arc::new(FixedProbe),
            indicator,
            send_timeout,
        },
        max_upload_bytes,
    )
}

pub async fn app_with_limit(storage: &MemoryStorage, max_upload_bytes: usize) -> Router {
    app_with(storage, max_upload_bytes, Duration::from_secs(5)).await
}

pub async fn app(storage: &MemoryStorage) -> Router {
    app_with_limit(storage, 1024 * 1024).await
}

pub async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.expect("router is infallible")
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body")
        .to_vec()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

pub fn multipart_upload(uri: &str, filename: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"update\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}
