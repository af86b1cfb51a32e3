//! Per-request orchestration: body decoding, routing, invocation and
//! response assembly, with failures mapped to HTTP responses.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRAILER, TRANSFER_ENCODING};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::chunked::{self, ChunkedError};
use crate::config::{EofFraming, QpxgConfig};
use crate::error::GatewayError;
use crate::meta::MetaVariableBuilder;
use crate::request::{BodyKind, RequestBody, RequestHead};
use crate::response::{CgiOutput, OutgoingResponse};
use crate::router::{Route, Router};

const DEFAULT_BODY_READ_TIMEOUT: Duration = Duration::from_secs(60);
const INITIAL_BODY_CAPACITY: u64 = 64 * 1024;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReceivingBody,
    Invoking,
    ReassemblingOutput,
    Responding,
    Failed(&'static str),
}

/// What the connection should do after a request.
#[derive(Debug)]
pub enum Outcome {
    Respond {
        response: OutgoingResponse,
        keep_alive: bool,
    },
    /// The client went away while the script ran; nothing is written.
    ClientGone,
}

pub struct Gateway {
    router: Router,
    workers: Arc<Semaphore>,
    max_request_body_bytes: usize,
    body_read_timeout: Duration,
    eof_framing: EofFraming,
}

impl Gateway {
    pub fn new(
        router: Router,
        workers: usize,
        max_request_body_bytes: usize,
        eof_framing: EofFraming,
    ) -> Self {
        Self {
            router,
            workers: Arc::new(Semaphore::new(workers)),
            max_request_body_bytes,
            body_read_timeout: DEFAULT_BODY_READ_TIMEOUT,
            eof_framing,
        }
    }

    /// Bound the time a client may take to deliver a request body.
    pub fn with_body_read_timeout(mut self, limit: Duration) -> Self {
        self.body_read_timeout = limit;
        self
    }

    pub fn from_config(config: &QpxgConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            Router::new(config)?,
            config.workers,
            config.max_request_body_bytes,
            config.eof_response_framing,
        )
        .with_body_read_timeout(Duration::from_millis(config.body_read_timeout_ms)))
    }

    /// Check that a request can be served before the client is asked to
    /// send its body (`Expect: 100-continue`).
    pub fn admit(&self, head: &RequestHead) -> Result<(), GatewayError> {
        if let BodyKind::Fixed(n) = head.body_kind()? {
            if n > self.max_request_body_bytes as u64 {
                return Err(GatewayError::RequestBodyTooLarge(self.max_request_body_bytes));
            }
        }
        let route = self.route(head)?;
        route.executor.resolve(head.uri.path(), route.prefix.as_deref())?;
        Ok(())
    }

    /// Run one request whose head has been read from `reader`. The body, if
    /// any, is consumed from `reader`; after that the reader is watched for
    /// client disconnect while the script runs.
    pub async fn serve<R>(&self, head: &mut RequestHead, reader: &mut R) -> Outcome
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let keep_alive = head.wants_keep_alive();
        let mut stage = Stage::ReceivingBody;
        debug!(method = %head.method, uri = %head.uri, "request received");

        match self.exchange(head, reader, &mut stage).await {
            Ok(Some(response)) => {
                debug!(status = response.status.as_u16(), "response ready");
                Outcome::Respond {
                    response,
                    keep_alive,
                }
            }
            Ok(None) => {
                info!(uri = %head.uri, "client disconnected; script terminated");
                Outcome::ClientGone
            }
            Err(err) => {
                let failed_in = stage;
                advance(&mut stage, Stage::Failed(err.kind()));
                warn!(
                    uri = %head.uri,
                    stage = ?failed_in,
                    kind = err.kind(),
                    status = err.status().as_u16(),
                    error = %err,
                    "request failed"
                );
                Outcome::Respond {
                    response: OutgoingResponse::from_error(&err),
                    keep_alive: keep_alive && err.keeps_connection(),
                }
            }
        }
    }

    async fn exchange<R>(
        &self,
        head: &mut RequestHead,
        reader: &mut R,
        stage: &mut Stage,
    ) -> Result<Option<OutgoingResponse>, GatewayError>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let kind = head.body_kind()?;
        let body = timeout(self.body_read_timeout, self.receive_body(head, kind, reader))
            .await
            .map_err(|_| GatewayError::BodyReadTimeout(self.body_read_timeout))??;
        advance(stage, Stage::Invoking);

        let head: &RequestHead = head;
        tokio::select! {
            biased;
            res = self.invoke(head, body, stage) => res.map(Some),
            () = client_gone(reader) => Ok(None),
        }
    }

    /// Read the whole request body. Chunk trailers are merged into the head.
    async fn receive_body<R>(
        &self,
        head: &mut RequestHead,
        kind: BodyKind,
        reader: &mut R,
    ) -> Result<Bytes, GatewayError>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        match RequestBody::new(kind, reader) {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Fixed(expected, reader) => {
                if expected > self.max_request_body_bytes as u64 {
                    return Err(GatewayError::RequestBodyTooLarge(
                        self.max_request_body_bytes,
                    ));
                }
                let mut buf = Vec::with_capacity(expected.min(INITIAL_BODY_CAPACITY) as usize);
                let received = reader.take(expected).read_to_end(&mut buf).await? as u64;
                if received < expected {
                    return Err(GatewayError::IncompleteRequestBody { expected, received });
                }
                Ok(Bytes::from(buf))
            }
            RequestBody::Chunked(reader) => {
                let decoded = chunked::decode(reader, self.max_request_body_bytes).await?;
                debug!(
                    decoded_len = decoded.body.len(),
                    trailers = decoded.trailers.len(),
                    "chunked body decoded"
                );
                merge_trailers(head, decoded.trailers)?;
                Ok(decoded.body)
            }
        }
    }

    async fn invoke(
        &self,
        head: &RequestHead,
        body: Bytes,
        stage: &mut Stage,
    ) -> Result<OutgoingResponse, GatewayError> {
        let path = head.uri.path();
        let route = self.route(head)?;
        let script = route.executor.resolve(path, route.prefix.as_deref())?;
        let env = MetaVariableBuilder::new(head, &script, body.len())
            .passthrough(route.executor.passthrough_env())
            .build();

        let _permit = self
            .workers
            .try_acquire()
            .map_err(|_| GatewayError::Overloaded)?;
        debug!(script = %script.filename.display(), env_vars = env.len(), "invoking script");
        let out = route.executor.execute(&script, &env, body).await?;
        if !out.status.success() {
            return Err(GatewayError::ScriptFailed(out.status));
        }

        advance(stage, Stage::ReassemblingOutput);
        let parsed = CgiOutput::parse(&out.stdout)?;
        advance(stage, Stage::Responding);
        Ok(parsed.into_response(self.eof_framing))
    }

    fn route(&self, head: &RequestHead) -> Result<Route, GatewayError> {
        let path = head.uri.path();
        self.router
            .route(path, request_host(head).as_deref())
            .ok_or_else(|| GatewayError::NoRoute(path.to_string()))
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    debug!(from = ?*stage, to = ?next, "stage");
    *stage = next;
}

/// Resolves once the client has closed its side of the connection.
/// Pipelined bytes are left in the buffer and keep the watcher pending.
async fn client_gone<R>(reader: &mut R)
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    if let Ok(buf) = reader.fill_buf().await {
        if !buf.is_empty() {
            std::future::pending::<()>().await;
        }
    }
}

fn merge_trailers(
    head: &mut RequestHead,
    trailers: Vec<(String, String)>,
) -> Result<(), GatewayError> {
    for (name, value) in trailers {
        let invalid = || ChunkedError::InvalidTrailer(name.clone());
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        if header == CONTENT_LENGTH || header == TRANSFER_ENCODING || header == HOST || header == TRAILER
        {
            debug!(trailer = %header, "ignoring framing field sent as trailer");
            continue;
        }
        let value = HeaderValue::from_str(&value).map_err(|_| invalid())?;
        head.headers.append(header, value);
    }
    Ok(())
}

/// Host used for routing: the Host header, else the URI authority, without port.
fn request_host(head: &RequestHead) -> Option<String> {
    let authority = head
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| head.uri.authority().map(|a| a.as_str()))?;
    let host = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    Some(host.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::executor::{ExecOutput, Executor, ScriptTarget};
    use crate::meta::MetaVariableSet;
    use async_trait::async_trait;
    use http::{Method, StatusCode, Uri};
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeExecutor {
        stdout: &'static [u8],
        exit_code: i32,
        hang: bool,
        calls: AtomicUsize,
        seen: Mutex<Option<(MetaVariableSet, Bytes)>>,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn resolve(
            &self,
            path: &str,
            _matched_prefix: Option<&str>,
        ) -> Result<ScriptTarget, GatewayError> {
            if path.ends_with("missing") {
                return Err(GatewayError::ScriptNotFound(PathBuf::from(path)));
            }
            Ok(ScriptTarget {
                script_name: path.to_string(),
                path_info: String::new(),
                filename: PathBuf::from("/srv/cgi").join(path.trim_start_matches('/')),
                document_root: PathBuf::from("/srv/cgi"),
                interpreter: None,
            })
        }

        fn passthrough_env(&self) -> &[(String, String)] {
            &[]
        }

        async fn execute(
            &self,
            _script: &ScriptTarget,
            env: &MetaVariableSet,
            body: Bytes,
        ) -> Result<ExecOutput, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = Some((env.clone(), body));
            if self.hang {
                let _guard = DropFlag(Arc::clone(&self.dropped));
                std::future::pending::<()>().await;
            }
            Ok(ExecOutput {
                stdout: Bytes::from_static(self.stdout),
                stderr: Bytes::new(),
                status: ExitStatus::from_raw(self.exit_code << 8),
            })
        }
    }

    fn gateway(exec: Arc<FakeExecutor>) -> Gateway {
        gateway_with_workers(exec, 4)
    }

    fn gateway_with_workers(exec: Arc<FakeExecutor>, workers: usize) -> Gateway {
        let router = Router::with_executors(vec![(
            MatchConfig {
                path_prefix: Some("/cgi-bin".into()),
                ..Default::default()
            },
            exec as Arc<dyn Executor>,
        )])
        .unwrap();
        Gateway::new(router, workers, 1024, EofFraming::ContentLength)
    }

    fn post(headers: &[(&'static str, &'static str)]) -> RequestHead {
        let mut head = RequestHead::new(Method::POST, Uri::from_static("/cgi-bin/form.sh?x=1"));
        for &(k, v) in headers {
            head.headers.append(k, HeaderValue::from_static(v));
        }
        head
    }

    fn expect_response(outcome: Outcome) -> (OutgoingResponse, bool) {
        match outcome {
            Outcome::Respond {
                response,
                keep_alive,
            } => (response, keep_alive),
            Outcome::ClientGone => panic!("unexpected ClientGone"),
        }
    }

    const OK_OUTPUT: &[u8] = b"Content-Type: text/plain\r\n\r\nok";

    #[tokio::test]
    async fn chunked_body_reaches_script_with_decoded_length() {
        let exec = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            ..Default::default()
        });
        let gw = gateway(Arc::clone(&exec));
        let mut head = post(&[
            ("transfer-encoding", "chunked"),
            ("content-type", "application/x-www-form-urlencoded"),
        ]);
        let mut reader: &[u8] = b"3\r\na=1\r\n3\r\n&b=\r\n1\r\n2\r\n0\r\n\r\n";

        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut reader).await);
        assert_eq!(resp.status, StatusCode::OK);
        assert!(keep_alive);

        let (env, body) = exec.seen.lock().unwrap().take().unwrap();
        assert_eq!(&body[..], b"a=1&b=2");
        assert_eq!(env.get("CONTENT_LENGTH"), Some("7"));
        assert_eq!(env.get("QUERY_STRING"), Some("x=1"));
        assert_eq!(env.get("HTTP_TRANSFER_ENCODING"), None);
    }

    #[tokio::test]
    async fn chunk_trailers_become_http_variables() {
        let exec = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            ..Default::default()
        });
        let gw = gateway(Arc::clone(&exec));
        let mut head = post(&[("transfer-encoding", "chunked")]);
        let mut reader: &[u8] = b"2\r\nhi\r\n0\r\nX-Checksum: abc\r\nContent-Length: 99\r\n\r\n";

        let (resp, _) = expect_response(gw.serve(&mut head, &mut reader).await);
        assert_eq!(resp.status, StatusCode::OK);
        let (env, _) = exec.seen.lock().unwrap().take().unwrap();
        assert_eq!(env.get("HTTP_X_CHECKSUM"), Some("abc"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("2"));
    }

    #[tokio::test]
    async fn malformed_chunks_never_reach_the_script() {
        let exec = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            ..Default::default()
        });
        let gw = gateway(Arc::clone(&exec));
        let mut head = post(&[("transfer-encoding", "chunked")]);
        let mut reader: &[u8] = b"zz\r\nabc\r\n0\r\n\r\n";

        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut reader).await);
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert!(!keep_alive);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_fixed_body_is_rejected() {
        let exec = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            ..Default::default()
        });
        let gw = gateway(Arc::clone(&exec));
        let mut head = post(&[("content-length", "10")]);
        let mut reader: &[u8] = b"abc";

        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut reader).await);
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert!(!keep_alive);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_bodies_get_413() {
        let gw = gateway(Arc::new(FakeExecutor::default()));
        let mut head = post(&[("content-length", "4096")]);
        let mut reader: &[u8] = b"";
        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut reader).await);
        assert_eq!(resp.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!keep_alive);
    }

    #[tokio::test]
    async fn routing_failures_keep_the_connection() {
        let gw = gateway(Arc::new(FakeExecutor::default()));

        let mut head = RequestHead::new(Method::GET, Uri::from_static("/elsewhere"));
        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut &b""[..]).await);
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert!(keep_alive);

        let mut head = RequestHead::new(Method::GET, Uri::from_static("/cgi-bin/missing"));
        let (resp, _) = expect_response(gw.serve(&mut head, &mut &b""[..]).await);
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn script_failures_map_to_server_errors() {
        let failing = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            exit_code: 3,
            ..Default::default()
        });
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/cgi-bin/a"));
        let (resp, _) =
            expect_response(gateway(failing).serve(&mut head, &mut &b""[..]).await);
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);

        let short = Arc::new(FakeExecutor {
            stdout: b"Content-Length: 50\r\n\r\nonly a few bytes",
            ..Default::default()
        });
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/cgi-bin/a"));
        let (resp, _) = expect_response(gateway(short).serve(&mut head, &mut &b""[..]).await);
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert!(resp.body.bytes().is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_invocation() {
        let exec = Arc::new(FakeExecutor {
            hang: true,
            ..Default::default()
        });
        let gw = gateway(Arc::clone(&exec));
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/cgi-bin/slow"));

        let outcome = gw.serve(&mut head, &mut &b""[..]).await;
        assert!(matches!(outcome, Outcome::ClientGone));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(exec.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn busy_workers_answer_503_without_spawning() {
        let exec = Arc::new(FakeExecutor {
            stdout: OK_OUTPUT,
            ..Default::default()
        });
        let gw = gateway_with_workers(Arc::clone(&exec), 0);
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/cgi-bin/a"));
        let (resp, keep_alive) = expect_response(gw.serve(&mut head, &mut &b""[..]).await);
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(keep_alive);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_body_sender_times_out_with_408() {
        use tokio::io::AsyncWriteExt;

        let cases: [(&[(&'static str, &'static str)], &[u8]); 2] = [
            (&[("content-length", "512")], b"partial"),
            (&[("transfer-encoding", "chunked")], b"1FF\r\nabc"),
        ];
        for (headers, sent) in cases {
            let exec = Arc::new(FakeExecutor {
                stdout: OK_OUTPUT,
                ..Default::default()
            });
            let gw = gateway(Arc::clone(&exec)).with_body_read_timeout(Duration::from_millis(100));
            let (mut client, server) = tokio::io::duplex(1024);
            client.write_all(sent).await.unwrap();
            let mut reader = tokio::io::BufReader::new(server);
            let mut head = post(headers);

            let outcome = tokio::time::timeout(
                Duration::from_secs(3),
                gw.serve(&mut head, &mut reader),
            )
            .await
            .expect("body read is bounded");
            let (resp, keep_alive) = expect_response(outcome);
            assert_eq!(resp.status, StatusCode::REQUEST_TIMEOUT);
            assert!(!keep_alive);
            assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
            drop(client);
        }
    }

    #[test]
    fn admit_checks_size_and_route_before_the_upload() {
        let gw = gateway(Arc::new(FakeExecutor::default()));
        assert!(gw.admit(&post(&[("content-length", "10")])).is_ok());
        assert!(gw.admit(&post(&[("transfer-encoding", "chunked")])).is_ok());

        let err = gw.admit(&post(&[("content-length", "4096")])).unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        for uri in ["/elsewhere", "/cgi-bin/missing"] {
            let mut head = RequestHead::new(Method::POST, Uri::from_static(uri));
            head.headers
                .append("content-length", HeaderValue::from_static("3"));
            assert_eq!(gw.admit(&head).unwrap_err().status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn host_for_routing_strips_port() {
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/"));
        head.headers
            .insert(HOST, HeaderValue::from_static("example.test:8080"));
        assert_eq!(request_host(&head).as_deref(), Some("example.test"));
        head.headers.insert(HOST, HeaderValue::from_static("[::1]:8080"));
        assert_eq!(request_host(&head).as_deref(), Some("::1"));
    }
}
