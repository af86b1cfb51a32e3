//! CGI response parsing (RFC 3875 section 6) and the outgoing HTTP response.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, LOCATION, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::chunked;
use crate::config::EofFraming;
use crate::error::GatewayError;

const MAX_CGI_HEADER_BYTES: usize = 64 * 1024;
const MAX_CGI_HEADER_LINES: usize = 200;
const RESPONSE_CHUNK_BYTES: usize = 16 * 1024;

/// How the length of a script's body is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// The script sent `Content-Length`.
    Declared(usize),
    /// The body ran until the script closed stdout.
    EofTerminated,
}

/// A parsed CGI response.
#[derive(Debug)]
pub struct CgiOutput {
    pub status: StatusCode,
    /// Reason phrase given by the script, if any.
    pub reason: Option<String>,
    /// Script headers, minus `Status`, `Content-Length` and hop-by-hop fields.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub framing: BodyFraming,
}

impl CgiOutput {
    /// Split raw script output into header block and body and resolve framing.
    pub fn parse(raw: &Bytes) -> Result<Self, GatewayError> {
        if raw.is_empty() {
            return Err(GatewayError::MalformedOutput("empty output".into()));
        }
        let (header_end, sep_len) = find_header_boundary(raw).ok_or_else(|| {
            GatewayError::MalformedOutput("missing blank line after headers".into())
        })?;
        if header_end > MAX_CGI_HEADER_BYTES {
            return Err(GatewayError::MalformedOutput("headers too large".into()));
        }
        let header_section = std::str::from_utf8(&raw[..header_end])
            .map_err(|_| GatewayError::MalformedOutput("headers are not UTF-8".into()))?;

        let mut status: Option<StatusCode> = None;
        let mut reason: Option<String> = None;
        let mut content_length: Option<usize> = None;
        let mut headers = HeaderMap::new();

        for (idx, line) in header_section.split('\n').enumerate() {
            if idx >= MAX_CGI_HEADER_LINES {
                return Err(GatewayError::MalformedOutput("too many header lines".into()));
            }
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            // Non-parsed-header style status line.
            if idx == 0 && line.starts_with("HTTP/") {
                let mut parts = line.splitn(3, ' ');
                let _version = parts.next();
                let (code, text) = parse_status(parts.next().unwrap_or(""), parts.next());
                status = Some(code);
                reason = text;
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                GatewayError::MalformedOutput(format!("header line without colon: {line:?}"))
            })?;
            let key = key.trim();
            let value = value.trim();

            if key.eq_ignore_ascii_case("Status") {
                let mut parts = value.splitn(2, ' ');
                let (code, text) = parse_status(parts.next().unwrap_or(""), parts.next());
                status = Some(code);
                reason = text;
                continue;
            }

            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                GatewayError::MalformedOutput(format!("invalid header name {key:?}"))
            })?;
            if name == CONTENT_LENGTH {
                let n = value.parse::<usize>().map_err(|_| {
                    GatewayError::MalformedOutput(format!("invalid Content-Length {value:?}"))
                })?;
                content_length = Some(n);
                continue;
            }
            if is_framing_header(&name) {
                debug!(header = %name, "dropping hop-by-hop header from CGI output");
                continue;
            }
            let value = HeaderValue::from_str(value).map_err(|_| {
                GatewayError::MalformedOutput(format!("invalid value for header {key:?}"))
            })?;
            headers.append(name, value);
        }

        // RFC 3875 section 6.2.3: a Location without Status is a redirect.
        let status = match status {
            Some(s) => s,
            None if headers.contains_key(LOCATION) => StatusCode::FOUND,
            None => StatusCode::OK,
        };

        let mut body = raw.slice(header_end + sep_len..);
        let framing = match content_length {
            Some(declared) => {
                if body.len() < declared {
                    return Err(GatewayError::IncompleteDeclaredBody {
                        declared,
                        actual: body.len(),
                    });
                }
                if body.len() > declared {
                    warn!(
                        declared,
                        actual = body.len(),
                        "CGI body longer than its Content-Length; discarding excess"
                    );
                    body.truncate(declared);
                }
                BodyFraming::Declared(declared)
            }
            None => BodyFraming::EofTerminated,
        };

        Ok(Self {
            status,
            reason,
            headers,
            body,
            framing,
        })
    }

    /// Fold into an outgoing response. EOF-terminated bodies are sent with
    /// their measured length or chunked, as configured.
    pub fn into_response(self, eof_framing: EofFraming) -> OutgoingResponse {
        let body = match (self.framing, eof_framing) {
            (BodyFraming::EofTerminated, EofFraming::Chunked) => ResponseBody::Chunked(self.body),
            _ => ResponseBody::Fixed(self.body),
        };
        OutgoingResponse {
            status: self.status,
            reason: self.reason,
            headers: self.headers,
            body,
        }
    }
}

fn parse_status(code: &str, text: Option<&str>) -> (StatusCode, Option<String>) {
    let code = code
        .trim()
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok());
    match code {
        Some(code) => {
            let reason = text
                .map(str::trim)
                .filter(|t| !t.is_empty() && t.bytes().all(|b| b == b'\t' || (b' '..=b'~').contains(&b)))
                .map(str::to_string);
            (code, reason)
        }
        None => (StatusCode::OK, None),
    }
}

fn is_framing_header(name: &HeaderName) -> bool {
    *name == TRANSFER_ENCODING || *name == CONNECTION || name.as_str() == "keep-alive"
}

/// Position of the first blank line and the length of its separator.
fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    (0..data.len()).find_map(|i| {
        if data[i..].starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if data[i..].starts_with(b"\n\n") {
            Some((i, 2))
        } else {
            None
        }
    })
}

/// Body of an outgoing response.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Empty,
    /// Sent with `Content-Length`.
    Fixed(Bytes),
    /// Sent with `Transfer-Encoding: chunked` to HTTP/1.1 clients.
    Chunked(Bytes),
}

impl ResponseBody {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Fixed(b) | Self::Chunked(b) => b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl OutgoingResponse {
    /// Response for a failed request: 4xx carry a one-line text body, 5xx
    /// carry the status only.
    pub fn from_error(err: &GatewayError) -> Self {
        Self::for_status(err.status())
    }

    pub fn for_status(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        let body = if status.is_client_error() {
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            let text = format!(
                "{} {}\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
            ResponseBody::Fixed(Bytes::from(text))
        } else {
            ResponseBody::Empty
        };
        Self {
            status,
            reason: None,
            headers,
            body,
        }
    }

    /// Serialize head and body for an HTTP/1.x client.
    ///
    /// `head_only` suppresses the body (HEAD requests) while keeping the
    /// length header the body would have had.
    pub fn encode(&self, version: Version, head_only: bool, keep_alive: bool) -> BytesMut {
        let body = self.body.bytes();
        let bodiless = self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        let chunked =
            matches!(self.body, ResponseBody::Chunked(_)) && version == Version::HTTP_11;

        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "{} {} {}\r\n",
            if version == Version::HTTP_10 {
                "HTTP/1.0"
            } else {
                "HTTP/1.1"
            },
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or("")
        );

        let mut out = BytesMut::with_capacity(head.len() + body.len() + 256);
        out.put_slice(head.as_bytes());
        for (name, value) in &self.headers {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        if !bodiless {
            if chunked {
                out.put_slice(b"transfer-encoding: chunked\r\n");
            } else {
                out.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
            }
        }
        if !keep_alive {
            out.put_slice(b"connection: close\r\n");
        } else if version == Version::HTTP_10 {
            out.put_slice(b"connection: keep-alive\r\n");
        }
        out.put_slice(b"\r\n");

        if !bodiless && !head_only {
            if chunked {
                out.extend_from_slice(&chunked::encode(body, RESPONSE_CHUNK_BYTES));
            } else {
                out.put_slice(body);
            }
        }
        out
    }
}
