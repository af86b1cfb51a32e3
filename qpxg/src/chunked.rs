//! Chunked transfer-coding (RFC 9112 section 7.1).
//!
//! The decoder reads from any buffered async source and reduces the chunk
//! sequence to one contiguous body; the encoder produces the wire framing used
//! for responses whose length is only known once the script has exited.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_LINE_BYTES: usize = 4096;
const MAX_TRAILER_BYTES: usize = 64 * 1024;
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line {0:?}")]
    InvalidSize(String),
    #[error("chunk data not followed by CRLF")]
    MissingCrlf,
    #[error("stream ended before the terminating chunk")]
    UnexpectedEof,
    #[error("chunk line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("invalid trailer field {0:?}")]
    InvalidTrailer(String),
    #[error("decoded body exceeds {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A fully decoded chunked body.
#[derive(Debug, Default)]
pub struct DecodedBody {
    pub body: Bytes,
    /// Trailer fields in the order they were received.
    pub trailers: Vec<(String, String)>,
}

/// Decode a chunked body from `reader`, consuming exactly the chunked message
/// framing and nothing after it.
///
/// On error nothing is returned: a partially decoded body is never handed out.
pub async fn decode<R>(reader: &mut R, max_body: usize) -> Result<DecodedBody, ChunkedError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut body = BytesMut::new();
    let mut line = Vec::with_capacity(64);

    loop {
        read_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        if body.len().checked_add(size).map_or(true, |n| n > max_body) {
            return Err(ChunkedError::TooLarge(max_body));
        }
        read_chunk_data(reader, &mut body, size).await?;
        expect_crlf(reader).await?;
    }

    let trailers = read_trailers(reader, &mut line).await?;
    Ok(DecodedBody {
        body: body.freeze(),
        trailers,
    })
}

/// Parse a chunk-size line (CRLF already stripped), ignoring chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let invalid = || ChunkedError::InvalidSize(String::from_utf8_lossy(line).into_owned());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = text
        .split_once(';')
        .map_or(text, |(size, _ext)| size)
        .trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let size = u64::from_str_radix(size, 16).map_err(|_| invalid())?;
    usize::try_from(size).map_err(|_| invalid())
}

/// Encode `body` as a chunk sequence of at most `chunk_size` bytes per chunk,
/// followed by the zero-size terminator and an empty trailer section.
pub fn encode(body: &[u8], chunk_size: usize) -> BytesMut {
    let chunk_size = chunk_size.max(1);
    let chunks = body.len().div_ceil(chunk_size);
    let mut out = BytesMut::with_capacity(body.len() + chunks * 12 + 5);
    let mut size_line = String::with_capacity(16);
    for part in body.chunks(chunk_size) {
        size_line.clear();
        let _ = write!(size_line, "{:x}\r\n", part.len());
        out.extend_from_slice(size_line.as_bytes());
        out.extend_from_slice(part);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"0\r\n\r\n");
    out
}

/// Append exactly `size` bytes to `body`, growing it only as data arrives.
async fn read_chunk_data<R>(
    reader: &mut R,
    body: &mut BytesMut,
    size: usize,
) -> Result<(), ChunkedError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut remaining = size;
    while remaining > 0 {
        body.reserve(remaining.min(READ_CHUNK_BYTES));
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_buf(body)
            .await?;
        if n == 0 {
            return Err(ChunkedError::UnexpectedEof);
        }
        remaining -= n;
    }
    Ok(())
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), ChunkedError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    line.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 2)
        .read_until(b'\n', line)
        .await?;
    if n == 0 {
        return Err(ChunkedError::UnexpectedEof);
    }
    if line.last() != Some(&b'\n') {
        if line.len() > MAX_LINE_BYTES {
            return Err(ChunkedError::LineTooLong);
        }
        return Err(ChunkedError::UnexpectedEof);
    }
    if !line.ends_with(b"\r\n") {
        return Err(ChunkedError::MissingCrlf);
    }
    line.truncate(line.len() - 2);
    Ok(())
}

async fn expect_crlf<R>(reader: &mut R) -> Result<(), ChunkedError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(eof_as_malformed)?;
    if &crlf != b"\r\n" {
        return Err(ChunkedError::MissingCrlf);
    }
    Ok(())
}

async fn read_trailers<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> Result<Vec<(String, String)>, ChunkedError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut trailers = Vec::new();
    let mut total = 0usize;
    loop {
        read_line(reader, line).await?;
        if line.is_empty() {
            return Ok(trailers);
        }
        total += line.len();
        if total > MAX_TRAILER_BYTES {
            return Err(ChunkedError::LineTooLong);
        }
        let invalid = || ChunkedError::InvalidTrailer(String::from_utf8_lossy(line).into_owned());
        let text = std::str::from_utf8(line).map_err(|_| invalid())?;
        let (name, value) = text.split_once(':').ok_or_else(invalid)?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(invalid());
        }
        trailers.push((name.to_string(), value.trim().to_string()));
    }
}

fn eof_as_malformed(err: std::io::Error) -> ChunkedError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ChunkedError::UnexpectedEof
    } else {
        ChunkedError::Io(err)
    }
}
