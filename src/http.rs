use std::{
    convert::Infallible,
    error::Error,
    fmt::Debug,
    marker::PhantomData,
    net::SocketAddr,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use crate::{
    connection_handler::ConnectionHandler,
    connections::ConnectionGetByHttpHost,
    error::ServerError,
    telemetry::{TELEMETRY_COUNTER_HTTP_REQUESTS_TOTAL, TELEMETRY_KEY_HOST},
};

use axum::{body::Body as AxumBody, response::IntoResponse};
use bon::Builder;
use http::{HeaderValue, Uri};
use hyper::{
    Request, Response, StatusCode,
    body::{Body, Incoming},
    client::conn::http1::SendRequest,
    header::{HOST, UPGRADE},
};
use hyper_util::rt::TokioIo;
use metrics::counter;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional_with_sizes},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
const X_FORWARDED_PORT: &str = "X-Forwarded-Port";

struct TimedResponse {
    response: Response<AxumBody>,
    log: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

struct TimedResponseBody {
    body: AxumBody,
    log: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

impl IntoResponse for TimedResponse {
    fn into_response(self) -> axum::response::Response {
        let (parts, body) = self.response.into_parts();
        Response::from_parts(
            parts,
            AxumBody::new(TimedResponseBody {
                body,
                log: self.log,
            }),
        )
    }
}

impl Body for TimedResponseBody {
    type Data = bytes::Bytes;

    type Error = axum::Error;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.body).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> hyper::body::SizeHint {
        self.body.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }
}

// Log once the response body has been fully sent (or dropped).
impl Drop for TimedResponseBody {
    fn drop(&mut self) {
        if let Some(log) = self.log.take() {
            (log)()
        }
    }
}

#[derive(Builder)]
struct HttpLog {
    ip: String,
    status: u16,
    method: String,
    host: String,
    uri: String,
    elapsed_time: Duration,
}

fn http_log(data: HttpLog) {
    let HttpLog {
        ip,
        status,
        method,
        host,
        uri,
        elapsed_time,
    } = data;
    debug!(histogram.http_elapsed_time = elapsed_time.as_secs_f64(), %status, %method, %host, %uri, %ip);
    info!("[{status}] {method} {host} => {uri} ({ip}) {elapsed_time:?}");
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("Handler not found")]
    HandlerNotFound,
    #[error("Header to string error: {0}")]
    HeaderToStrError(#[from] http::header::ToStrError),
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Invalid Host header")]
    InvalidHostHeader,
    #[error("Missing Upgrade header")]
    MissingUpgradeHeader,
    #[error("Timed out waiting for proxy connection")]
    ProxyTimeout,
    #[error("Tunnel closed")]
    TunnelClosed,
    #[error("Request timeout")]
    RequestTimeout,
}

impl From<ServerError> for HttpError {
    fn from(error: ServerError) -> Self {
        match error {
            ServerError::ProxyTimeout => HttpError::ProxyTimeout,
            _ => HttpError::TunnelClosed,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        debug!(error = %self, "HTTP proxy error.");
        match self {
            HttpError::HeaderToStrError(_)
            | HttpError::MissingHostHeader
            | HttpError::InvalidHostHeader => StatusCode::BAD_REQUEST,
            HttpError::HandlerNotFound => StatusCode::NOT_FOUND,
            HttpError::ProxyTimeout | HttpError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            HttpError::HyperError(_)
            | HttpError::MissingUpgradeHeader
            | HttpError::TunnelClosed => StatusCode::BAD_GATEWAY,
        }
        .into_response()
    }
}

// Data commonly reused between HTTP proxy requests.
#[derive(Builder)]
pub(crate) struct ProxyData<M, H, T>
where
    M: ConnectionGetByHttpHost<Arc<H>>,
    H: ConnectionHandler<T>,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    // Registry that returns the control connection for a given host.
    conn_manager: M,
    // Public HTTP port, for the X-Forwarded-Port header.
    http_port: u16,
    // Buffer size for bidirectional copying.
    buffer_size: usize,
    // Optional duration until an outgoing request is canceled.
    http_request_timeout: Option<Duration>,
    // Optional duration until an established Websocket connection is canceled.
    websocket_timeout: Option<Duration>,
    #[builder(skip)]
    _phantom_data: PhantomData<(H, T)>,
}

// Remove the port from a Host header, keeping IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}

// Receive an HTTP request and appropriately proxy it, with a possible upgrade to WebSocket.
pub(crate) async fn proxy_handler<B, M, H, T>(
    request: Request<B>,
    tcp_address: SocketAddr,
    proxy_data: Arc<ProxyData<M, H, T>>,
) -> Result<Response<AxumBody>, Infallible>
where
    M: ConnectionGetByHttpHost<Arc<H>>,
    H: ConnectionHandler<T>,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    match proxy_handler_inner(request, tcp_address, proxy_data).await {
        Ok(response) => Ok(response.into_response()),
        Err(error) => Ok(error.into_response()),
    }
}

#[tracing::instrument(skip(proxy_data), level = "debug")]
async fn proxy_handler_inner<B, M, H, T>(
    mut request: Request<B>,
    tcp_address: SocketAddr,
    proxy_data: Arc<ProxyData<M, H, T>>,
) -> Result<TimedResponse, HttpError>
where
    M: ConnectionGetByHttpHost<Arc<H>>,
    H: ConnectionHandler<T>,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    let timer = Instant::now();
    // Retrieve host from the headers
    let host = request
        .headers()
        .get(HOST)
        .ok_or(HttpError::MissingHostHeader)?
        .to_str()
        .map_err(|_| HttpError::InvalidHostHeader)?;
    let host = strip_port(host).to_ascii_lowercase();
    if host.is_empty() {
        return Err(HttpError::InvalidHostHeader);
    }
    let ip = tcp_address.ip().to_canonical().to_string();
    let http_log_builder = HttpLog::builder()
        .ip(ip.clone())
        .host(host.clone())
        .uri(request.uri().path().into())
        .method(request.method().as_str().into());
    // Find the control connection for the given host
    let handler = proxy_data
        .conn_manager
        .get_by_http_host(&host)
        .ok_or(HttpError::HandlerNotFound)?;
    counter!(TELEMETRY_COUNTER_HTTP_REQUESTS_TOTAL, TELEMETRY_KEY_HOST => host.clone())
        .increment(1);
    // Add proxied info to the proper headers
    let headers = request.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    headers.insert(X_FORWARDED_PORT, proxy_data.http_port.into());
    // Change URI to only include path and query
    *request.uri_mut() = request
        .uri()
        .path_and_query()
        .and_then(|path| Uri::from_str(path.as_str()).ok())
        .unwrap_or_default();

    let cancellation_token = handler.cancellation_token();
    let io = handler.tunneling_channel().await?;

    // Create an HTTP/1.1 handshake over the proxy connection
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    let conn_token = cancellation_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = conn.with_upgrades() => {
                if let Err(error) = result {
                    warn!(%error, "HTTP/1.1 connection failed.");
                }
            }
            _ = conn_token.cancelled() => {}
        }
    });

    // Check for an Upgrade header
    let request_upgrade = match request.headers().get(UPGRADE) {
        Some(header) => Some(header.to_str()?.to_string()),
        None => None,
    };
    let upgraded_request = request_upgrade
        .is_some()
        .then(|| hyper::upgrade::on(&mut request));
    let mut response = match send_request(
        &mut sender,
        request,
        proxy_data.http_request_timeout,
        &cancellation_token,
    )
    .await
    {
        Ok(response) => response,
        Err(HttpError::RequestTimeout) => {
            http_log(
                http_log_builder
                    .status(StatusCode::GATEWAY_TIMEOUT.as_u16())
                    .elapsed_time(timer.elapsed())
                    .build(),
            );
            return Err(HttpError::RequestTimeout);
        }
        Err(error) => return Err(error),
    };
    // Check if the underlying server accepts the Upgrade request
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let (Some(request_type), Some(upgraded_request)) = (request_upgrade, upgraded_request) {
            let response_type = response
                .headers()
                .get(UPGRADE)
                .ok_or(HttpError::MissingUpgradeHeader)?
                .to_str()?;
            if request_type.eq_ignore_ascii_case(response_type) {
                // Retrieve the upgraded connection from the response
                let upgraded_response = hyper::upgrade::on(&mut response).await?;
                let websocket_timeout = proxy_data.websocket_timeout;
                let buffer_size = proxy_data.buffer_size;
                // Start a task to copy data between the two Upgraded parts
                tokio::spawn(async move {
                    let upgraded_request = match upgraded_request.await {
                        Ok(upgraded_request) => upgraded_request,
                        Err(error) => {
                            warn!(%error, "Failed to upgrade incoming request.");
                            return;
                        }
                    };
                    let mut upgraded_request = TokioIo::new(upgraded_request);
                    let mut upgraded_response = TokioIo::new(upgraded_response);
                    let copy = async {
                        match websocket_timeout {
                            // If there is a Websocket timeout, copy until the deadline is reached.
                            Some(duration) => {
                                let _ = timeout(duration, async {
                                    copy_bidirectional_with_sizes(
                                        &mut upgraded_response,
                                        &mut upgraded_request,
                                        buffer_size,
                                        buffer_size,
                                    )
                                    .await
                                })
                                .await;
                            }
                            None => {
                                let _ = copy_bidirectional_with_sizes(
                                    &mut upgraded_response,
                                    &mut upgraded_request,
                                    buffer_size,
                                    buffer_size,
                                )
                                .await;
                            }
                        }
                    };
                    tokio::select! {
                        _ = copy => {}
                        _ = cancellation_token.cancelled() => {}
                    }
                });
            }
        }
    }
    // Return the received response to the client
    let http_log_builder = http_log_builder.status(response.status().as_u16());
    Ok(TimedResponse {
        response: response.into_response(),
        log: Some(Box::new(move || {
            http_log(http_log_builder.elapsed_time(timer.elapsed()).build())
        })),
    })
}

// Send the request through the tunnel, giving up if the tunnel closes or the timeout elapses.
async fn send_request<B>(
    sender: &mut SendRequest<B>,
    request: Request<B>,
    request_timeout: Option<Duration>,
    cancellation_token: &CancellationToken,
) -> Result<Response<Incoming>, HttpError>
where
    B: Body + 'static,
{
    let response = async {
        match request_timeout {
            // Await for a response under the given duration.
            Some(duration) => timeout(duration, sender.send_request(request))
                .await
                .map_err(|_| HttpError::RequestTimeout)?
                .map_err(HttpError::from),
            None => sender.send_request(request).await.map_err(HttpError::from),
        }
    };
    tokio::select! {
        response = response => response,
        _ = cancellation_token.cancelled() => Err(HttpError::TunnelClosed),
    }
}
