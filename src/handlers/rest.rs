//! Direct Transfer HTTP Server
//!
//! Clients move bytes over connection ids handed out by lifecycle
//! commands.
//!
//! ```text
//!   GET  /files/read?connectionID=   ──► reader stream (Range aware)
//!   POST /files/write?connectionID=  ──► write_by_connection (Content-Length)
//!   POST /files/close?connectionID=  ──► close_by_connection
//!   POST /commands                   ──► lifecycle channel
//!   GET  /healthz, GET /metrics
//! ```

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::ports::LifecycleCommand;
use crate::error::{Error, Result};
use crate::handlers::lifecycle::decode_command;
use crate::metrics;
use crate::service::FileService;
use crate::storage::FileReader;

/// Largest frame sent per read of a download
const STREAM_CHUNK: usize = 64 * 1024;

const CONNECTION_PARAM: &str = "connectionID";

pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub addr: SocketAddr,
    /// Time a connection may sit without sending a request head
    pub idle_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Routes requests onto the file service
pub struct RestHandler {
    service: Arc<FileService>,
    commands: Option<mpsc::Sender<LifecycleCommand>>,
}

impl std::fmt::Debug for RestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestHandler")
            .field("accepts_commands", &self.commands.is_some())
            .finish()
    }
}

impl RestHandler {
    pub fn new(service: Arc<FileService>) -> Self {
        Self {
            service,
            commands: None,
        }
    }

    /// Accept lifecycle commands on `POST /commands`
    pub fn with_commands(mut self, commands: mpsc::Sender<LifecycleCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Bind `config.addr` and serve until `shutdown` fires
    pub async fn serve(self: Arc<Self>, config: RestConfig, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(config.addr).await?;
        self.serve_on(listener, config.idle_timeout, shutdown).await
    }

    /// Serve connections accepted from `listener`
    pub async fn serve_on(
        self: Arc<Self>,
        listener: TcpListener,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.route(req).await) }
                });

                let mut builder = http1::Builder::new();
                builder.timer(TokioTimer::new()).header_read_timeout(idle_timeout);
                if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }

        info!("HTTP server stopped");
        Ok(())
    }

    /// Dispatch one request. Never fails: errors become JSON responses.
    pub async fn route<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/files/read") => self.read(req).await,
            (&Method::POST, "/files/write") => self.write(req).await,
            (&Method::POST, "/files/close") => self.close(req).await,
            (&Method::POST, "/commands") => self.command(req).await,
            (&Method::GET, "/healthz") => Ok(self.health()),
            (&Method::GET, "/metrics") => export_metrics(),
            _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
        };

        result.unwrap_or_else(|e| {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(%method, %path, error = %e, "Request failed");
            } else {
                debug!(%method, %path, error = %e, "Request rejected");
            }
            error_response(status, &e.to_string())
        })
    }

    #[instrument(skip(self, req))]
    async fn read<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>> {
        let connection = connection_id(&req)?;
        let reader = self.service.read_by_connection(connection)?;
        let len = reader.len().await?;

        let range = byte_range(
            req.headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok()),
            len,
        );

        let builder = Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::ACCEPT_RANGES, "bytes");

        let (builder, remaining) = match range {
            ByteRange::Unsatisfiable => {
                return Ok(Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", len))
                    .body(empty())
                    .map_err(|e| Error::Internal(e.to_string()))?);
            }
            ByteRange::Partial { start, end } => {
                reader.seek(io::SeekFrom::Start(start)).await?;
                (
                    builder
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
                    end - start + 1,
                )
            }
            ByteRange::Full => {
                let position = reader.position().await;
                (builder.status(StatusCode::OK), len.saturating_sub(position))
            }
        };

        builder
            .header(header::CONTENT_LENGTH, remaining)
            .body(reader_body(reader, remaining))
            .map_err(|e| Error::Internal(e.to_string()))
    }

    #[instrument(skip(self, req))]
    async fn write<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let connection = connection_id(&req)?;
        let expected = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidRequest("Content-Length is required".into()))?;

        let body = StreamReader::new(Box::pin(
            req.into_body().into_data_stream().map_err(io::Error::other),
        ));

        // The transfer outlives this future so a disconnect (which drops
        // it) cancels the upload instead of abandoning it mid-way.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let service = Arc::clone(&self.service);
        let transfer = tokio::spawn(async move {
            service
                .write_by_connection(connection, body, expected, &cancel)
                .await
        });

        let written = transfer
            .await
            .map_err(|e| Error::Internal(format!("upload task failed: {}", e)))??;

        json_response(StatusCode::OK, &json!({ "written": written }))
    }

    #[instrument(skip(self, req))]
    async fn close<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>> {
        let connection = connection_id(&req)?;
        self.service.close_by_connection(connection).await?;
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty())
            .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn command<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error,
    {
        let Some(commands) = &self.commands else {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "lifecycle commands are not accepted here",
            ));
        };

        let payload = req
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::InvalidRequest(e.to_string()))?
            .to_bytes();
        let command = decode_command(&payload)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let id = command.id;

        if commands.send(command).await.is_err() {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "lifecycle handler stopped",
            ));
        }
        json_response(StatusCode::ACCEPTED, &json!({ "id": id }))
    }

    fn health(&self) -> Response<ResponseBody> {
        let controller = self.service.controller();
        let ledger = controller.ledger();
        let body = json!({
            "status": "ok",
            "files": controller.file_count(),
            "used_bytes": ledger.current(),
            "max_bytes": ledger.max(),
            "readers": self.service.readers().len(),
            "writers": self.service.writers().len(),
        });
        json_response(StatusCode::OK, &body)
            .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
    }
}

fn export_metrics() -> Result<Response<ResponseBody>> {
    let (content_type, buffer) = metrics::encode()?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(full(buffer))
        .map_err(|e| Error::Internal(e.to_string()))
}

// =============================================================================
// Helpers
// =============================================================================

/// HTTP status for a failed request
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) | Error::Io(_) | Error::Cancelled => StatusCode::BAD_REQUEST,
        Error::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::NotFound(_) | Error::Closed(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `connectionID` query parameter
fn connection_id<B>(req: &Request<B>) -> Result<Uuid> {
    let query = req.uri().query().unwrap_or_default();
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CONNECTION_PARAM)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .and_then(|value| Uuid::parse_str(&value).ok())
        .ok_or_else(|| Error::InvalidRequest(format!("invalid {}", CONNECTION_PARAM)))
}

/// Outcome of matching a `Range` header against an object length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a `Range` header. Multi-range requests fall back to the full
/// body.
pub fn byte_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = ranges.trim().split_once('-') else {
        return ByteRange::Unsatisfiable;
    };

    let parsed = match (first.trim(), last.trim()) {
        ("", suffix) => suffix.parse::<u64>().ok().and_then(|n| {
            (n > 0 && len > 0).then(|| (len.saturating_sub(n), len - 1))
        }),
        (start, "") => start
            .parse::<u64>()
            .ok()
            .and_then(|s| (s < len).then(|| (s, len - 1))),
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(s), Ok(e)) if s <= e && s < len => Some((s, e.min(len - 1))),
            _ => None,
        },
    };

    match parsed {
        Some((start, end)) => ByteRange::Partial { start, end },
        None => ByteRange::Unsatisfiable,
    }
}

/// Stream `remaining` bytes from the reader's current position
fn reader_body(reader: Arc<FileReader>, remaining: u64) -> ResponseBody {
    let frames = stream::unfold((reader, remaining), |(reader, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let mut buf = vec![0u8; STREAM_CHUNK.min(remaining as usize)];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((
                    Ok(Frame::data(Bytes::from(buf))),
                    (reader, remaining - n as u64),
                ))
            }
            Err(e) => Some((Err(io::Error::other(e)), (reader, 0))),
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty() -> ResponseBody {
    full(Bytes::new())
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Result<Response<ResponseBody>> {
    let body = serde_json::to_vec(value)?;
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full(body))
        .map_err(|e| Error::Internal(e.to_string()))
}

fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full(json!({ "error": message }).to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingOrigin;
    use crate::domain::ports::CommandKind;
    use crate::service::ServiceConfig;
    use crate::storage::{InMemoryFileSystem, StorageController};
    use std::path::Path;

    const HOST: &str = "http://origin";

    struct Fixture {
        handler: Arc<RestHandler>,
        service: Arc<FileService>,
        origin: Arc<RecordingOrigin>,
    }

    async fn fixture(max: u64, seed: &[(Uuid, &[u8])]) -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        for (id, content) in seed {
            fs.insert(Path::new("/store").join(id.to_string()), content.to_vec());
        }
        let controller = StorageController::open("/store", max, fs).await.unwrap();
        let origin = Arc::new(RecordingOrigin::new());
        let service = Arc::new(FileService::new(
            Arc::new(controller),
            origin.clone(),
            ServiceConfig::default(),
        ));
        Fixture {
            handler: Arc::new(RestHandler::new(Arc::clone(&service))),
            service,
            origin,
        }
    }

    fn request(method: Method, uri: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_of(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn error_of(response: Response<ResponseBody>) -> String {
        let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
        value["error"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_byte_range() {
        assert_eq!(byte_range(None, 10), ByteRange::Full);
        assert_eq!(byte_range(Some("items=0-1"), 10), ByteRange::Full);
        assert_eq!(byte_range(Some("bytes=0-1,4-5"), 10), ByteRange::Full);
        assert_eq!(
            byte_range(Some("bytes=2-5"), 10),
            ByteRange::Partial { start: 2, end: 5 }
        );
        assert_eq!(
            byte_range(Some("bytes=2-"), 10),
            ByteRange::Partial { start: 2, end: 9 }
        );
        assert_eq!(
            byte_range(Some("bytes=-3"), 10),
            ByteRange::Partial { start: 7, end: 9 }
        );
        assert_eq!(
            byte_range(Some("bytes=5-100"), 10),
            ByteRange::Partial { start: 5, end: 9 }
        );
        assert_eq!(byte_range(Some("bytes=10-"), 10), ByteRange::Unsatisfiable);
        assert_eq!(byte_range(Some("bytes=5-2"), 10), ByteRange::Unsatisfiable);
        assert_eq!(byte_range(Some("bytes=-0"), 10), ByteRange::Unsatisfiable);
        assert_eq!(byte_range(Some("bytes=x-1"), 10), ByteRange::Unsatisfiable);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&Error::QuotaExceeded {
                requested: 2,
                available: 1
            }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(status_for(&Error::Closed("reader")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let f = fixture(1024, &[]).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let mut req = request(
            Method::POST,
            &format!("/files/write?connectionID={}", conn),
            b"hello and welcome",
        );
        req.headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(17u64));
        let response = f.handler.route(req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let read_conn = f.service.open_file(id).await.unwrap();
        let response = f
            .handler
            .route(request(
                Method::GET,
                &format!("/files/read?connectionID={}", read_conn),
                b"",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "17");
        assert_eq!(&body_of(response).await[..], b"hello and welcome");
    }

    #[tokio::test]
    async fn test_read_range() {
        let id = Uuid::new_v4();
        let f = fixture(1024, &[(id, &b"hello and welcome"[..])]).await;
        let conn = f.service.open_file(id).await.unwrap();

        let mut req = request(
            Method::GET,
            &format!("/files/read?connectionID={}", conn),
            b"",
        );
        req.headers_mut()
            .insert(header::RANGE, header::HeaderValue::from_static("bytes=10-"));
        let response = f.handler.route(req).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 10-16/17");
        assert_eq!(&body_of(response).await[..], b"welcome");

        let mut req = request(
            Method::GET,
            &format!("/files/read?connectionID={}", conn),
            b"",
        );
        req.headers_mut()
            .insert(header::RANGE, header::HeaderValue::from_static("bytes=40-"));
        let response = f.handler.route(req).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */17");
    }

    #[tokio::test]
    async fn test_invalid_connection_id() {
        let f = fixture(1024, &[]).await;
        let response = f
            .handler
            .route(request(Method::GET, "/files/read?connectionID=nope", b""))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(response).await, "Invalid request: invalid connectionID");

        let response = f
            .handler
            .route(request(
                Method::POST,
                &format!("/files/close?connectionID={}", Uuid::new_v4()),
                b"",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_write_requires_content_length() {
        let f = fixture(1024, &[]).await;
        let conn = f.service.create_file(HOST, Uuid::new_v4()).await.unwrap();
        let response = f
            .handler
            .route(request(
                Method::POST,
                &format!("/files/write?connectionID={}", conn),
                b"abc",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // rejected before any byte moved, nothing to compensate
        assert!(f.origin.failed_objects().is_empty());
    }

    #[tokio::test]
    async fn test_write_over_quota() {
        let f = fixture(4, &[]).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let mut req = request(
            Method::POST,
            &format!("/files/write?connectionID={}", conn),
            b"too large",
        );
        req.headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(9u64));
        let response = f.handler.route(req).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(f.origin.failed_objects(), vec![(HOST.to_string(), id)]);
    }

    #[tokio::test]
    async fn test_close_connection() {
        let id = Uuid::new_v4();
        let f = fixture(1024, &[(id, &b"abc"[..])]).await;
        let conn = f.service.open_file(id).await.unwrap();

        let uri = format!("/files/close?connectionID={}", conn);
        let response = f.handler.route(request(Method::POST, &uri, b"")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(f.service.readers().is_empty());
    }

    #[tokio::test]
    async fn test_commands_are_enqueued() {
        let f = fixture(1024, &[]).await;
        let (tx, mut rx) = mpsc::channel(1);
        let handler = RestHandler::new(Arc::clone(&f.service)).with_commands(tx);

        let command = LifecycleCommand {
            id: Uuid::new_v4(),
            host: HOST.into(),
            kind: CommandKind::Create,
            file_id: Uuid::new_v4(),
            size: 3,
        };
        let payload = serde_json::to_vec(&command).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/commands")
            .body(Full::new(Bytes::from(payload)))
            .unwrap();
        assert_eq!(handler.route(req).await.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await.unwrap(), command);

        let response = handler
            .route(request(Method::POST, "/commands", b"{"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_commands_disabled() {
        let f = fixture(1024, &[]).await;
        let response = f
            .handler
            .route(request(Method::POST, "/commands", b"{}"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_and_unknown_route() {
        let id = Uuid::new_v4();
        let f = fixture(1024, &[(id, &b"abcd"[..])]).await;

        let response = f.handler.route(request(Method::GET, "/healthz", b"")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(value["files"], 1);
        assert_eq!(value["used_bytes"], 4);

        let response = f.handler.route(request(Method::GET, "/nowhere", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let id = Uuid::new_v4();
        let f = fixture(1024, &[(id, &b"over the wire"[..])]).await;
        let conn = f.service.open_file(id).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(Arc::clone(&f.handler).serve_on(
            listener,
            Duration::from_secs(5),
            shutdown.clone(),
        ));

        let body = reqwest::get(format!("http://{}/files/read?connectionID={}", addr, conn))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], b"over the wire");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
