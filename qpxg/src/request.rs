use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use std::net::SocketAddr;

use crate::error::GatewayError;

/// An HTTP request head as handed to the gateway by the front end.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            remote_addr: None,
            local_addr: None,
        }
    }

    /// How the request body is delimited on the wire.
    pub fn body_kind(&self) -> Result<BodyKind, GatewayError> {
        let has_te = self.headers.contains_key(TRANSFER_ENCODING);
        let content_length = parse_content_length(&self.headers)?;

        if has_te {
            if content_length.is_some() {
                return Err(GatewayError::BadFraming(
                    "both Transfer-Encoding and Content-Length present",
                ));
            }
            if self.version == Version::HTTP_10 {
                return Err(GatewayError::BadFraming(
                    "Transfer-Encoding on an HTTP/1.0 request",
                ));
            }
            let codings = self
                .headers
                .get_all(TRANSFER_ENCODING)
                .iter()
                .map(|v| v.to_str().unwrap_or("<non-ascii>"))
                .flat_map(|v| v.split(','))
                .map(|v| v.trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>();
            return match codings.as_slice() {
                [only] if only == "chunked" => Ok(BodyKind::Chunked),
                _ => Err(GatewayError::UnsupportedTransferCoding(codings.join(", "))),
            };
        }

        Ok(match content_length {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Fixed(n),
        })
    }

    /// Whether the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .headers
                .get(http::header::EXPECT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Whether the connection may be kept open after this exchange.
    pub fn wants_keep_alive(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        match self.version {
            Version::HTTP_11 => !tokens.iter().any(|t| t == "close"),
            Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
            _ => false,
        }
    }
}

/// Body framing derived from the request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Fixed(u64),
    Chunked,
}

/// A request body still on the wire.
#[derive(Debug)]
pub enum RequestBody<R> {
    Empty,
    Fixed(u64, R),
    Chunked(R),
}

impl<R> RequestBody<R> {
    pub fn new(kind: BodyKind, source: R) -> Self {
        match kind {
            BodyKind::Empty => Self::Empty,
            BodyKind::Fixed(n) => Self::Fixed(n, source),
            BodyKind::Chunked => Self::Chunked(source),
        }
    }
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, GatewayError> {
    let mut found: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| GatewayError::BadFraming("invalid Content-Length"))?;
        // A list of identical values is tolerated (RFC 9110 section 8.6).
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(GatewayError::BadFraming("invalid Content-Length"));
            }
            let n: u64 = part
                .parse()
                .map_err(|_| GatewayError::BadFraming("invalid Content-Length"))?;
            match found {
                Some(prev) if prev != n => {
                    return Err(GatewayError::BadFraming("conflicting Content-Length values"))
                }
                _ => found = Some(n),
            }
        }
    }
    Ok(found)
}

pub(crate) fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
