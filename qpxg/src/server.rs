use anyhow::Result;
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::config::QpxgConfig;
use crate::gateway::{Gateway, Outcome};
use crate::request::{BodyKind, RequestHead};
use crate::response::OutgoingResponse;

const MAX_REQUEST_HEADERS: usize = 128;

/// Per-connection limits taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_requests_per_connection: usize,
    pub max_request_header_bytes: usize,
    pub header_read_timeout: Duration,
    pub conn_idle: Duration,
}

impl ConnectionLimits {
    pub fn from_config(config: &QpxgConfig) -> Self {
        Self {
            max_requests_per_connection: config.max_requests_per_connection,
            max_request_header_bytes: config.max_request_header_bytes,
            header_read_timeout: Duration::from_millis(config.header_read_timeout_ms),
            conn_idle: Duration::from_millis(config.conn_idle_timeout_ms),
        }
    }
}

#[derive(Debug, Error)]
enum HeadError {
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("too many request header fields")]
    TooManyHeaders,
    #[error("malformed request head: {0}")]
    Malformed(String),
    #[error("connection closed inside request head")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeadError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            Self::TooLarge(_) | Self::TooManyHeaders => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Self::Malformed(_) => Some(StatusCode::BAD_REQUEST),
            Self::Closed | Self::Io(_) => None,
        }
    }
}

/// Accept TCP connections until the listener fails.
pub async fn serve_tcp(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    limits: ConnectionLimits,
    max_connections: usize,
) -> Result<()> {
    let conn_semaphore = Arc::new(Semaphore::new(max_connections));
    loop {
        let (stream, peer) = listener.accept().await?;
        let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                warn!(peer = %peer, "too many concurrent connections; dropping");
                continue;
            }
        };
        let local = stream.local_addr().ok();
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(stream, gateway, limits, Some(peer), local).await {
                warn!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

/// Serve HTTP/1.x requests on one connection until it closes, goes idle,
/// or hits the keep-alive cap.
pub async fn handle_connection<S>(
    stream: S,
    gateway: Arc<Gateway>,
    limits: ConnectionLimits,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (rx, mut tx) = tokio::io::split(stream);
    let mut reader = BufReader::new(rx);
    let mut handled_requests: usize = 0;

    loop {
        // Wait for the next request; an idle or closed connection ends quietly.
        match timeout(limits.conn_idle, reader.fill_buf()).await {
            Err(_) => {
                debug!("idle connection closed");
                return Ok(());
            }
            Ok(Ok(buf)) if buf.is_empty() => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }

        let raw = match timeout(
            limits.header_read_timeout,
            read_head(&mut reader, limits.max_request_header_bytes),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                if let Some(status) = err.status() {
                    warn!(error = %err, "rejecting request head");
                    write_final(&mut tx, &OutgoingResponse::for_status(status), Version::HTTP_11)
                        .await?;
                }
                return Ok(());
            }
            Err(_) => {
                warn!("timed out reading request head");
                let resp = OutgoingResponse::for_status(StatusCode::REQUEST_TIMEOUT);
                write_final(&mut tx, &resp, Version::HTTP_11).await?;
                return Ok(());
            }
        };

        let mut head = match parse_head(&raw, remote_addr, local_addr) {
            Ok(head) => head,
            Err(err) => {
                warn!(error = %err, "rejecting request head");
                let status = err.status().unwrap_or(StatusCode::BAD_REQUEST);
                write_final(&mut tx, &OutgoingResponse::for_status(status), Version::HTTP_11)
                    .await?;
                return Ok(());
            }
        };

        if head.expects_continue()
            && matches!(head.body_kind(), Ok(BodyKind::Fixed(_) | BodyKind::Chunked))
        {
            // Answer without inviting the upload; the unread body forces a close.
            if let Err(err) = gateway.admit(&head) {
                warn!(uri = %head.uri, kind = err.kind(), error = %err, "rejecting before 100-continue");
                write_final(&mut tx, &OutgoingResponse::from_error(&err), head.version).await?;
                return Ok(());
            }
            tx.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            tx.flush().await?;
        }

        handled_requests = handled_requests.saturating_add(1);
        let version = head.version;
        let head_only = head.method == Method::HEAD;

        match gateway.serve(&mut head, &mut reader).await {
            Outcome::ClientGone => return Ok(()),
            Outcome::Respond {
                response,
                keep_alive,
            } => {
                let keep_alive =
                    keep_alive && handled_requests < limits.max_requests_per_connection;
                let wire = response.encode(version, head_only, keep_alive);
                tx.write_all(&wire).await?;
                tx.flush().await?;
                if !keep_alive {
                    let _ = tx.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn write_final<W>(tx: &mut W, resp: &OutgoingResponse, version: Version) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tx.write_all(&resp.encode(version, false, false)).await?;
    tx.flush().await?;
    let _ = tx.shutdown().await;
    Ok(())
}

/// Read raw bytes up to and including the blank line ending a request head.
async fn read_head<R>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>, HeadError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let budget = (max_bytes + 1).saturating_sub(raw.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        if raw.len() + n > max_bytes {
            return Err(HeadError::TooLarge(max_bytes));
        }
        if line.last() != Some(&b'\n') {
            return Err(HeadError::Closed);
        }
        let blank = line == b"\r\n" || line == b"\n";
        // Empty lines before the request line are ignored (RFC 9112 section 2.2).
        if blank && raw.is_empty() {
            continue;
        }
        raw.extend_from_slice(&line);
        if blank {
            return Ok(raw);
        }
    }
}

fn parse_head(
    raw: &[u8],
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> Result<RequestHead, HeadError> {
    let mut fields = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
    let mut req = httparse::Request::new(&mut fields);
    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HeadError::Malformed("incomplete request head".into()))
        }
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooManyHeaders),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| HeadError::Malformed("invalid method".into()))?;
    let target = req
        .path
        .ok_or_else(|| HeadError::Malformed("missing request target".into()))?;
    let uri: Uri = target
        .parse()
        .map_err(|_| HeadError::Malformed(format!("invalid request target {target:?}")))?;
    if uri.path().is_empty() || !uri.path().starts_with('/') {
        return Err(HeadError::Malformed(format!(
            "unsupported request target {target:?}"
        )));
    }
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(HeadError::Malformed("unsupported HTTP version".into())),
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for field in req.headers.iter() {
        let name = HeaderName::from_bytes(field.name.as_bytes())
            .map_err(|_| HeadError::Malformed(format!("invalid header name {:?}", field.name)))?;
        let value = HeaderValue::from_bytes(field.value)
            .map_err(|_| HeadError::Malformed(format!("invalid value for {:?}", field.name)))?;
        headers.append(name, value);
    }
    if version == Version::HTTP_11 && headers.get_all(HOST).iter().count() != 1 {
        return Err(HeadError::Malformed(
            "HTTP/1.1 request needs exactly one Host".into(),
        ));
    }

    debug!(method = %method, uri = %uri, "request head parsed");
    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
        remote_addr,
        local_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EofFraming;
    use crate::router::Router;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_requests_per_connection: 10,
            max_request_header_bytes: 4096,
            header_read_timeout: Duration::from_millis(200),
            conn_idle: Duration::from_millis(200),
        }
    }

    /// Feed `raw` to a connection with no handlers and collect everything it
    /// writes before closing. The client side stays open throughout.
    async fn converse(raw: &[u8]) -> String {
        let router = Router::with_executors(Vec::new()).unwrap();
        let gateway = Arc::new(
            Gateway::new(router, 1, 1024, EofFraming::ContentLength)
                .with_body_read_timeout(Duration::from_millis(200)),
        );
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(raw).await.unwrap();

        timeout(
            Duration::from_secs(3),
            handle_connection(server, gateway, limits(), None, None),
        )
        .await
        .expect("connection finishes on its own")
        .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn stalled_request_body_gets_408() {
        let fixed = converse(b"POST /cgi-bin/a HTTP/1.1\r\nHost: a\r\nContent-Length: 512\r\n\r\n").await;
        assert!(fixed.starts_with("HTTP/1.1 408"), "{fixed}");

        let chunked = converse(
            b"POST /cgi-bin/a HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n1FF\r\n",
        )
        .await;
        assert!(chunked.starts_with("HTTP/1.1 408"), "{chunked}");
    }

    #[tokio::test]
    async fn rejected_requests_are_not_invited_to_upload() {
        let unrouted = converse(
            b"POST /nowhere HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n",
        )
        .await;
        assert!(unrouted.starts_with("HTTP/1.1 404"), "{unrouted}");
        assert!(!unrouted.contains("100 Continue"));

        let oversized = converse(
            b"POST /nowhere HTTP/1.1\r\nHost: a\r\nContent-Length: 4096\r\nExpect: 100-continue\r\n\r\n",
        )
        .await;
        assert!(oversized.starts_with("HTTP/1.1 413"), "{oversized}");
        assert!(oversized.contains("connection: close"), "{oversized}");
    }

    #[tokio::test]
    async fn reads_head_up_to_blank_line() {
        let mut input: &[u8] = b"\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\nBODY";
        let raw = read_head(&mut input, 1024).await.unwrap();
        assert_eq!(raw, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(input, b"BODY");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut big = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        big.extend(std::iter::repeat(b'a').take(2048));
        big.extend_from_slice(b"\r\n\r\n");
        let mut input: &[u8] = &big;
        let err = read_head(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge(1024)));
        assert_eq!(
            err.status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
    }

    #[tokio::test]
    async fn truncated_head_is_a_close() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n";
        let err = read_head(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed));
    }

    #[test]
    fn parses_request_head() {
        let peer: SocketAddr = "192.0.2.7:5555".parse().unwrap();
        let head = parse_head(
            b"POST /cgi-bin/a.sh/extra?q=1 HTTP/1.1\r\nHost: example.test\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n",
            Some(peer),
            None,
        )
        .unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.uri.path(), "/cgi-bin/a.sh/extra");
        assert_eq!(head.uri.query(), Some("q=1"));
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get_all("cookie").iter().count(), 2);
        assert_eq!(head.remote_addr, Some(peer));
    }

    #[test]
    fn rejects_bad_heads() {
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\n\r\n", None, None),
            Err(HeadError::Malformed(_))
        ));
        assert!(matches!(
            parse_head(b"GET / HTTP/2.0\r\nHost: a\r\n\r\n", None, None),
            Err(HeadError::Malformed(_))
        ));
        assert!(matches!(
            parse_head(b"GET * HTTP/1.1\r\nHost: a\r\n\r\n", None, None),
            Err(HeadError::Malformed(_))
        ));
        let head = parse_head(b"GET /x HTTP/1.0\r\n\r\n", None, None).unwrap();
        assert_eq!(head.version, Version::HTTP_10);
    }
}
