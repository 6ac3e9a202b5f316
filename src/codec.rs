//! Incremental HTTP/1.1 framing.
//!
//! Requests are decoded from a buffered reader: the head is accumulated
//! line by line until the blank line and parsed with `httparse`, then the
//! body is read according to its transport (`Content-Length` or chunked).
//! Every read that would block suspends the calling task through the
//! reader's underlying [`AsyncSocket`][crate::async_socket::AsyncSocket].
//!
//! Responses are serialized head-first; buffered bodies are framed with
//! `Content-Length` and streamed bodies with `Transfer-Encoding: chunked`.

use std::fmt;
use std::io;
use std::io::Write as _;
use std::str::FromStr;

use futures_lite::io::{AsyncBufRead, AsyncWrite};
use futures_lite::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, StreamExt};

use crate::http::{reason_phrase, Body, Headers, Method, Request, Response};

const MAX_HEADERS: usize = 64;

/// Sent before reading the body when the peer asked for `100-continue`.
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Implementer-tunable parsing limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum size of the request line plus headers.
    pub max_head_bytes: usize,
    /// Maximum size of a buffered request body.
    pub max_body_bytes: usize,
    /// Maximum size of a single line (chunk sizes, trailers).
    pub max_line_bytes: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_head_bytes: 16 * 1024,
            max_body_bytes: 4 * 1024 * 1024,
            max_line_bytes: 8 * 1024,
        }
    }
}

/// Errors produced while framing HTTP.
#[derive(Debug)]
pub enum HttpError {
    /// The peer sent something that is not valid HTTP/1.1.
    BadRequest(&'static str),
    /// A configured limit was exceeded.
    TooLarge,
    /// The transport failed mid-message.
    Io(io::Error),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::BadRequest(reason) => write!(f, "bad request: {}", reason),
            HttpError::TooLarge => f.write_str("message exceeds configured limits"),
            HttpError::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> HttpError {
        HttpError::Io(err)
    }
}

/// How a request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyTransport {
    None,
    Fixed(usize),
    Chunked,
}

/// Reads one request head, or `None` on a clean end-of-stream at a message
/// boundary.
pub(crate) async fn decode_head<R>(
    reader: &mut R,
    limits: &Limits,
) -> Result<Option<Request>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::BadRequest("truncated head"));
        }
        if buf.len() > limits.max_head_bytes {
            return Err(HttpError::TooLarge);
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        // A bare CRLF before the request line is tolerated padding between
        // pipelined messages.
        if buf == b"\r\n" {
            buf.clear();
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(&buf)
        .map_err(|_| HttpError::BadRequest("malformed head"))?;
    if status.is_partial() {
        return Err(HttpError::BadRequest("malformed head"));
    }

    let method = parsed.method.ok_or(HttpError::BadRequest("missing method"))?;
    let target = parsed.path.ok_or(HttpError::BadRequest("missing target"))?;
    if parsed.version != Some(1) {
        return Err(HttpError::BadRequest("unsupported protocol version"));
    }

    let (path, query) = split_target(target);
    let mut request = Request::new(Method::from_str(method).unwrap(), path);
    request.query = query;
    for header in parsed.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| HttpError::BadRequest("header value is not valid UTF-8"))?;
        request.headers.append(header.name, value.trim());
    }
    Ok(Some(request))
}

/// Splits a request target into its path and parsed query items.
///
/// Values are compared raw; percent-decoding is left to handlers.
fn split_target(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query_string)) => {
            let mut query = Vec::new();
            for item in query_string.split('&').filter(|s| !s.is_empty()) {
                match item.split_once('=') {
                    Some((name, value)) => query.push((name.to_string(), value.to_string())),
                    None => query.push((item.to_string(), String::new())),
                }
            }
            (path.to_string(), query)
        }
        None => (target.to_string(), Vec::new()),
    }
}

/// Selects the body transport from the head, rejecting the ambiguous
/// combination of `Content-Length` and chunked encoding (RFC 7230 §3.3.3).
pub(crate) fn body_transport(headers: &Headers) -> Result<BodyTransport, HttpError> {
    let chunked = headers.contains_token("Transfer-Encoding", "chunked");
    let length = match headers.get("Content-Length") {
        Some(value) => Some(
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| HttpError::BadRequest("invalid Content-Length"))?,
        ),
        None => None,
    };
    match (chunked, length) {
        (true, Some(_)) => Err(HttpError::BadRequest(
            "both Content-Length and Transfer-Encoding present",
        )),
        (true, None) => Ok(BodyTransport::Chunked),
        (false, Some(length)) => Ok(BodyTransport::Fixed(length)),
        (false, None) => Ok(BodyTransport::None),
    }
}

/// Reads a request body into a buffer, bounded by `limits`.
pub(crate) async fn read_body<R>(
    reader: &mut R,
    transport: BodyTransport,
    limits: &Limits,
) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    match transport {
        BodyTransport::None => Ok(Vec::new()),
        BodyTransport::Fixed(length) => {
            if length > limits.max_body_bytes {
                return Err(HttpError::TooLarge);
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            Ok(body)
        }
        BodyTransport::Chunked => read_chunked(reader, limits).await,
    }
}

async fn read_chunked<R>(reader: &mut R, limits: &Limits) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader, limits.max_line_bytes).await?;
        // Chunk extensions after ';' are ignored.
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| HttpError::BadRequest("invalid chunk size"))?;

        if size == 0 {
            // Discard optional trailers up to the final blank line.
            loop {
                let trailer = read_line(reader, limits.max_line_bytes).await?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        // Saturating: a huge hex size must not wrap the bounds check.
        if size > limits.max_body_bytes.saturating_sub(body.len()) {
            return Err(HttpError::TooLarge);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(HttpError::BadRequest("chunk not terminated by CRLF"));
        }
    }
}

/// Reads a single CRLF-terminated line, returning it without the terminator.
async fn read_line<R>(reader: &mut R, max: usize) -> Result<String, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(HttpError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    if line.len() > max {
        return Err(HttpError::TooLarge);
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| HttpError::BadRequest("line is not valid UTF-8"))
}

/// Serializes a response.
///
/// `head_only` suppresses the body bytes (for `HEAD` requests) while keeping
/// the framing headers; `close` advertises `Connection: close`.
pub(crate) async fn encode_response<W>(
    writer: &mut W,
    mut response: Response,
    head_only: bool,
    close: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match &response.body {
        Body::Empty => {
            if needs_length(response.status) {
                response.headers.insert("Content-Length", "0");
            }
        }
        Body::Bytes(bytes) => {
            let length = bytes.len().to_string();
            response.headers.insert("Content-Length", length);
        }
        Body::Stream(_) => {
            response.headers.insert("Transfer-Encoding", "chunked");
        }
        // The connection loop performs upgrades before serialization.
        Body::Upgrade(_) => {}
    }
    if close {
        response.headers.insert("Connection", "close");
    }

    let mut head = Vec::with_capacity(128);
    write!(
        head,
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    )?;
    for (name, value) in response.headers.iter() {
        write!(head, "{}: {}\r\n", name, value)?;
    }
    head.extend_from_slice(b"\r\n");
    writer.write_all(&head).await?;

    if !head_only {
        match response.body {
            Body::Empty | Body::Upgrade(_) => {}
            Body::Bytes(bytes) => writer.write_all(&bytes).await?,
            Body::Stream(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    let frame = format!("{:X}\r\n", chunk.len());
                    writer.write_all(frame.as_bytes()).await?;
                    writer.write_all(&chunk).await?;
                    writer.write_all(b"\r\n").await?;
                }
                writer.write_all(b"0\r\n\r\n").await?;
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Whether a status code carries a message body at all.
fn needs_length(status: u16) -> bool {
    !matches!(status, 100..=199 | 204 | 304)
}
