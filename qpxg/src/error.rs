use http::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::chunked::ChunkedError;

/// Per-request failure kinds. Every variant is local to one request.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed chunked request body: {0}")]
    MalformedChunkedBody(#[source] ChunkedError),

    #[error("request body ended after {received} of {expected} bytes")]
    IncompleteRequestBody { expected: u64, received: u64 },

    #[error("request body exceeds configured limit: {0} bytes")]
    RequestBodyTooLarge(usize),

    #[error("request body not received within {0:?}")]
    BodyReadTimeout(Duration),

    #[error("invalid request framing: {0}")]
    BadFraming(&'static str),

    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferCoding(String),

    #[error("no handler matches {0}")]
    NoRoute(String),

    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("forbidden script path: {0}")]
    Forbidden(String),

    #[error("failed to spawn {}: {source}", program.display())]
    SpawnFailure {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CGI script timed out after {0:?}")]
    Timeout(Duration),

    #[error("CGI stdout exceeded size limit of {0} bytes")]
    OutputTooLarge(usize),

    #[error("CGI declared Content-Length {declared} but produced {actual} bytes")]
    IncompleteDeclaredBody { declared: usize, actual: usize },

    #[error("malformed CGI output: {0}")]
    MalformedOutput(String),

    #[error("all workers busy")]
    Overloaded,

    #[error("CGI script exited with {0}")]
    ScriptFailed(std::process::ExitStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status the client sees for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedChunkedBody(ChunkedError::TooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MalformedChunkedBody(_)
            | Self::IncompleteRequestBody { .. }
            | Self::BadFraming(_) => StatusCode::BAD_REQUEST,
            Self::RequestBodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BodyReadTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::UnsupportedTransferCoding(_) => StatusCode::NOT_IMPLEMENTED,
            Self::NoRoute(_) | Self::ScriptNotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::SpawnFailure { .. }
            | Self::OutputTooLarge(_)
            | Self::ScriptFailed(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::IncompleteDeclaredBody { .. } | Self::MalformedOutput(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Short machine-friendly label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedChunkedBody(ChunkedError::TooLarge(_)) => "request_body_too_large",
            Self::MalformedChunkedBody(_) => "malformed_chunked_body",
            Self::IncompleteRequestBody { .. } => "incomplete_request_body",
            Self::RequestBodyTooLarge(_) => "request_body_too_large",
            Self::BodyReadTimeout(_) => "body_read_timeout",
            Self::BadFraming(_) => "bad_framing",
            Self::UnsupportedTransferCoding(_) => "unsupported_transfer_coding",
            Self::NoRoute(_) => "no_route",
            Self::ScriptNotFound(_) => "script_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::Timeout(_) => "timeout",
            Self::OutputTooLarge(_) => "output_too_large",
            Self::IncompleteDeclaredBody { .. } => "incomplete_declared_body",
            Self::MalformedOutput(_) => "malformed_output",
            Self::Overloaded => "overloaded",
            Self::ScriptFailed(_) => "script_failed",
            Self::Io(_) => "io",
        }
    }

    /// Whether the connection can be reused after answering with this error.
    ///
    /// Framing errors leave the request stream at an unknown offset.
    pub fn keeps_connection(&self) -> bool {
        !matches!(
            self,
            Self::MalformedChunkedBody(_)
                | Self::IncompleteRequestBody { .. }
                | Self::RequestBodyTooLarge(_)
                | Self::BodyReadTimeout(_)
                | Self::BadFraming(_)
                | Self::UnsupportedTransferCoding(_)
                | Self::Io(_)
        )
    }
}

impl From<ChunkedError> for GatewayError {
    fn from(err: ChunkedError) -> Self {
        match err {
            ChunkedError::Io(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => Self::Io(e),
            other => Self::MalformedChunkedBody(other),
        }
    }
}
