//! Relay between a caller and a provider's upstream tool server.
//!
//! Message bodies pass through untouched. The forwarder only owns the session
//! header: it attaches the provider's current token on the way up, and on the
//! way down the token is read by the handshake path and never copied to the
//! caller.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use mcp_meter::{EVENT_STREAM, PROTOCOL_VERSION_HEADER, SESSION_HEADER, UNARY_ACCEPT};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::ProxyError;
use crate::metrics;

/// Allowlist of response headers to forward from the upstream.
/// The session header is left out: the proxy owns the upstream session.
const ALLOWED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "vary",
    "x-request-id",
    PROTOCOL_VERSION_HEADER,
];

/// Maximum buffered upstream response body size (10 MB).
const MAX_RESPONSE_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Caller headers that are meaningful to the upstream protocol.
#[derive(Debug, Clone, Default)]
pub struct CallerHeaders {
    pub protocol_version: Option<String>,
    pub last_event_id: Option<String>,
}

impl CallerHeaders {
    pub fn from_request(req: &actix_web::HttpRequest) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        Self {
            protocol_version: header(PROTOCOL_VERSION_HEADER),
            last_event_id: header("last-event-id"),
        }
    }
}

/// Send one protocol message upstream. The caller's body is forwarded verbatim.
pub async fn send_message(
    client: &reqwest::Client,
    upstream_url: &str,
    body: Bytes,
    session: Option<&str>,
    caller: &CallerHeaders,
) -> Result<reqwest::Response, ProxyError> {
    let mut builder = client
        .post(upstream_url)
        .header("Content-Type", "application/json")
        .header("Accept", UNARY_ACCEPT);

    if let Some(token) = session {
        builder = builder.header(SESSION_HEADER, token);
    }
    if let Some(ref version) = caller.protocol_version {
        builder = builder.header(PROTOCOL_VERSION_HEADER, version);
    }

    let timer = metrics::FORWARD_LATENCY.start_timer();
    let response = builder.body(body).send().await.map_err(|e| {
        tracing::warn!(upstream = %upstream_url, error = %e, "upstream request failed");
        ProxyError::UpstreamUnavailable(format!("upstream request failed: {e}"))
    });
    timer.observe_duration();
    response
}

/// Open the upstream's server-push channel.
pub async fn open_stream(
    client: &reqwest::Client,
    upstream_url: &str,
    session: Option<&str>,
    caller: &CallerHeaders,
) -> Result<reqwest::Response, ProxyError> {
    let mut builder = client.get(upstream_url).header("Accept", EVENT_STREAM);

    if let Some(token) = session {
        builder = builder.header(SESSION_HEADER, token);
    }
    if let Some(ref version) = caller.protocol_version {
        builder = builder.header(PROTOCOL_VERSION_HEADER, version);
    }
    if let Some(ref last_id) = caller.last_event_id {
        builder = builder.header("Last-Event-ID", last_id);
    }

    builder.send().await.map_err(|e| {
        tracing::warn!(upstream = %upstream_url, error = %e, "upstream stream request failed");
        ProxyError::UpstreamUnavailable(format!("stream request failed: {e}"))
    })
}

/// Session token the upstream returned, if any.
pub fn session_token(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

pub fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with(EVENT_STREAM))
        .unwrap_or(false)
}

/// Turn an upstream reply into the caller's response, mirroring its status.
///
/// Event-stream replies are relayed chunk by chunk; anything else is
/// buffered up to 10 MB.
pub async fn relay(
    mut response: reqwest::Response,
    streams: &StreamTracker,
    provider_id: &str,
) -> Result<HttpResponse, ProxyError> {
    let mut builder = HttpResponse::build(
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    copy_allowed_headers(&response, &mut builder);

    if is_event_stream(&response) {
        let guard = streams.open(provider_id);
        builder.insert_header(("Cache-Control", "no-cache"));
        return Ok(builder.streaming(GuardedStream::new(response, guard)));
    }

    // Check Content-Length before reading (fast path)
    if let Some(cl) = response.content_length() {
        if cl > MAX_RESPONSE_BODY_SIZE as u64 {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "upstream response too large: {} bytes (max {})",
                cl, MAX_RESPONSE_BODY_SIZE
            )));
        }
    }

    let mut body_buf = Vec::with_capacity(
        response
            .content_length()
            .map(|cl| cl as usize)
            .unwrap_or(8192)
            .min(MAX_RESPONSE_BODY_SIZE),
    );
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        ProxyError::UpstreamUnavailable(format!("failed to read upstream response: {e}"))
    })? {
        if body_buf.len() + chunk.len() > MAX_RESPONSE_BODY_SIZE {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "upstream response too large (max {} bytes)",
                MAX_RESPONSE_BODY_SIZE
            )));
        }
        body_buf.extend_from_slice(&chunk);
    }

    Ok(builder.body(Bytes::from(body_buf)))
}

/// Relay an upstream server-push channel to the caller.
pub fn relay_stream(
    response: reqwest::Response,
    streams: &StreamTracker,
    provider_id: &str,
) -> HttpResponse {
    let guard = streams.open(provider_id);
    HttpResponse::Ok()
        .content_type(EVENT_STREAM)
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(GuardedStream::new(response, guard))
}

fn copy_allowed_headers(response: &reqwest::Response, builder: &mut actix_web::HttpResponseBuilder) {
    for (name, value) in response.headers().iter() {
        let name_lower = name.as_str().to_lowercase();
        if ALLOWED_RESPONSE_HEADERS.contains(&name_lower.as_str()) {
            if let Ok(value_str) = value.to_str() {
                builder.insert_header((name.as_str(), value_str));
            }
        }
    }
}

/// Counts open stream relays.
#[derive(Debug, Clone, Default)]
pub struct StreamTracker {
    active: Arc<AtomicUsize>,
}

impl StreamTracker {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn open(&self, provider_id: &str) -> StreamGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIVE_STREAMS.inc();
        tracing::debug!(provider = %provider_id, "stream relay opened");
        StreamGuard {
            active: self.active.clone(),
            provider_id: provider_id.to_string(),
        }
    }
}

/// Released when the relay body is dropped, whether the upstream finished
/// or the caller went away.
struct StreamGuard {
    active: Arc<AtomicUsize>,
    provider_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_STREAMS.dec();
        tracing::debug!(provider = %self.provider_id, "stream relay closed");
    }
}

/// Upstream byte stream that owns its upstream connection and guard.
/// Dropping it (caller disconnect) closes the upstream connection.
struct GuardedStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    _guard: StreamGuard,
}

impl GuardedStream {
    fn new(response: reqwest::Response, guard: StreamGuard) -> Self {
        Self {
            inner: response.bytes_stream().boxed(),
            _guard: guard,
        }
    }
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|item| {
            item.map(|chunk| {
                chunk.map_err(|e| {
                    tracing::warn!(error = %e, "upstream stream interrupted");
                    std::io::Error::other(e)
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_response_headers() {
        assert!(ALLOWED_RESPONSE_HEADERS.contains(&"content-type"));
        assert!(ALLOWED_RESPONSE_HEADERS.contains(&"mcp-protocol-version"));
        assert!(!ALLOWED_RESPONSE_HEADERS.contains(&SESSION_HEADER));
        assert!(!ALLOWED_RESPONSE_HEADERS.contains(&"server"));
        assert!(!ALLOWED_RESPONSE_HEADERS.contains(&"set-cookie"));
    }

    #[test]
    fn test_tracker_counts_guards() {
        let tracker = StreamTracker::default();
        let a = tracker.open("weather");
        let b = tracker.open("weather");
        assert_eq!(tracker.active(), 2);
        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }
}
