//! HTTP dispatcher: routes requests onto the device and streams responses.
//!
//! Every handler takes the device lock for the whole request. An asset
//! response keeps holding it until its body has been streamed or the client
//! stalls past the send timeout, so requests are handled strictly one after
//! another.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};

use crate::assets::{ActivityIndicator, ClientStream};
use crate::device::Device;
use crate::resolver::{AssetRequest, ResolvedAsset};
use crate::scheduler::Uptime;
use crate::storage::AssetReader;
use crate::telemetry::PlatformProbe;
use crate::upload::{Completion, UploadPipeline, UploadSummary};

const STREAM_CHUNK: usize = 4096;
const STREAM_DEPTH: usize = 4;

#[derive(Clone)]
pub struct AppState {
    pub device: Arc<Mutex<Device>>,
    pub uptime: Uptime,
    pub probe: Arc<dyn PlatformProbe>,
    pub indicator: Arc<dyn ActivityIndicator>,
    /// Longest wait for a stalled client to accept the next response chunk.
    pub send_timeout: Duration,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/update", post(update))
        .fallback(asset)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(Shared {
            app: state,
            max_upload_bytes,
        })
}

/// Router state: the shared app state plus the raw-body size cap.
#[derive(Clone)]
struct Shared {
    app: AppState,
    max_upload_bytes: usize,
}

/// Feeds the response body through a bounded channel so the copy runs at the
/// pace the client drains it. A client that stops draining for longer than
/// `send_timeout` fails the delivery.
struct ChannelStream {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    send_timeout: Duration,
}

impl ChannelStream {
    async fn send(&self, chunk: Bytes) -> io::Result<()> {
        match tokio::time::timeout(self.send_timeout, self.tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client disconnected",
            )),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client stopped reading",
            )),
        }
    }
}

#[async_trait]
impl ClientStream for ChannelStream {
    async fn stream(&mut self, reader: &mut AssetReader, _asset: &ResolvedAsset) -> io::Result<u64> {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut sent = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ok(sent),
                Ok(n) => n,
                Err(err) => {
                    let kind = err.kind();
                    self.tx
                        .try_send(Err(io::Error::new(kind, "asset read failed")))
                        .ok();
                    return Err(err);
                }
            };
            self.send(Bytes::copy_from_slice(&buf[..n])).await?;
            sent += n as u64;
        }
    }
}

fn channel_body(rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> Body {
    Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Decodes `%XX` escapes in a request path. Malformed escapes pass through;
/// `None` when the decoded bytes are not UTF-8.
pub fn decode_path(raw: &str) -> Option<String> {
    urlencoding::decode(raw).ok().map(|path| path.into_owned())
}

fn wants_download(uri: &Uri) -> bool {
    uri.query()
        .map(|query| {
            query
                .split('&')
                .any(|pair| pair.split('=').next() == Some("download"))
        })
        .unwrap_or(false)
}

fn not_found(path: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("404 Not Found\n\nURI: {path}")).into_response()
}

async fn asset(State(shared): State<Shared>, uri: Uri) -> Response {
    let Some(path) = decode_path(uri.path()) else {
        tracing::debug!(uri = %uri, "request path is not valid UTF-8");
        return not_found(uri.path());
    };
    let mut request = AssetRequest::new(path);
    request.download = wants_download(&uri);

    let mut device = shared.app.device.clone().lock_owned().await;
    let Some(prepared) = device.prepare_asset(&request).await else {
        tracing::debug!(path = %request.path, "no asset matched");
        return not_found(uri.path());
    };

    let content_type = HeaderValue::from_static(prepared.asset.content_type);
    let compressed = prepared.asset.is_compressed;
    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    let send_timeout = shared.app.send_timeout;
    tokio::spawn(async move {
        let mut client = ChannelStream { tx, send_timeout };
        // Outcome is logged by the asset server; the lock drops once streaming ends.
        let _ = device.deliver_asset(prepared, &mut client).await;
    });

    let mut response = Response::new(channel_body(rx));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    if compressed {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    response
}

async fn status(State(shared): State<Shared>) -> Response {
    let app = &shared.app;
    let device = app.device.lock().await;
    app.indicator.set_active(true);
    let report = device.status(app.uptime.millis(), app.probe.as_ref());
    app.indicator.set_active(false);
    Json(report).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct UpdateParams {
    token: Option<String>,
    filename: Option<String>,
}

fn log_summary(summary: Option<UploadSummary>) {
    if let Some(summary) = summary {
        tracing::info!(
            path = ?summary.path,
            authorized = summary.authorized,
            bytes_received = summary.bytes_received,
            bytes_written = summary.bytes_written,
            suspect = summary.suspect,
            "upload session closed"
        );
    }
}

async fn receive_multipart(
    uploads: &mut UploadPipeline,
    token: Option<&str>,
    mut multipart: Multipart,
) -> Result<(), StatusCode> {
    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "malformed multipart body");
                return Err(err.status());
            }
        };
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        uploads.start(token, &filename).await;
        let received = loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    uploads.write(&chunk).await;
                }
                Ok(None) => break Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, filename = %filename, "upload body interrupted");
                    break Err(err.status());
                }
            }
        };
        log_summary(uploads.end().await);
        received?;
    }
}

async fn receive_raw(
    uploads: &mut UploadPipeline,
    token: Option<&str>,
    filename: &str,
    body: Body,
    limit: usize,
) -> Result<(), StatusCode> {
    let mut stream = body.into_data_stream();
    uploads.start(token, filename).await;
    let mut total = 0usize;
    let received = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                total = total.saturating_add(chunk.len());
                if total > limit {
                    tracing::warn!(limit, filename, "upload exceeds size limit");
                    break Err(StatusCode::PAYLOAD_TOO_LARGE);
                }
                uploads.write(&chunk).await;
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, filename, "upload body interrupted");
                break Err(StatusCode::BAD_REQUEST);
            }
            None => break Ok(()),
        }
    };
    log_summary(uploads.end().await);
    received
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false)
}

async fn update(
    State(shared): State<Shared>,
    Query(params): Query<UpdateParams>,
    request: Request,
) -> Response {
    let token = params.token.as_deref();
    let mut device = shared.app.device.lock().await;

    let received = if is_multipart(&request) {
        match Multipart::from_request(request, &()).await {
            Ok(multipart) => receive_multipart(&mut device.uploads, token, multipart).await,
            Err(rejection) => {
                tracing::warn!(error = %rejection, "rejected multipart upload");
                Err(rejection.status())
            }
        }
    } else {
        let filename = params.filename.as_deref().unwrap_or_default();
        receive_raw(
            &mut device.uploads,
            token,
            filename,
            request.into_body(),
            shared.max_upload_bytes,
        )
        .await
    };

    match (device.uploads.complete(token), received) {
        (Completion::Unauthorized, _) => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        (Completion::SeeOther(_), Err(status)) => {
            (status, "Upload incomplete").into_response()
        }
        (Completion::SeeOther(location), Ok(())) => Redirect::to(location).into_response(),
    }
}
