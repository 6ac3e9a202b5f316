//! HTTP request and response types.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures_lite::stream::Stream;

use crate::handler::Unhandled;
use crate::websocket::WsHandler;

/// An HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Other(name) => name,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Method, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered header map with case-insensitive name lookup.
///
/// Names keep the casing they were inserted with; serialization preserves
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a header, replacing any existing values for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// The first value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether any value of `name` contains `token` in its comma-separated
    /// list, compared case-insensitively.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }
}

/// A parsed HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Path parameters captured by the matched route, in capture order.
    pub(crate) parameters: Vec<(String, String)>,
}

impl Request {
    /// Creates a request with an empty body; useful in tests and handlers.
    pub fn new(method: Method, path: impl Into<String>) -> Request {
        Request {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Headers::new(),
            body: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// The first query value for `name`.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// A captured path parameter converted to the requested type.
    ///
    /// A missing parameter or a failed conversion signals [`Unhandled`], so
    /// a handler can decline a request whose captures do not fit and let
    /// matching continue.
    pub fn parameter<T: FromStr>(&self, name: &str) -> Result<T, Unhandled> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.parse().ok())
            .ok_or(Unhandled)
    }

    /// A captured path parameter by position.
    pub fn parameter_at<T: FromStr>(&self, index: usize) -> Result<T, Unhandled> {
        self.parameters
            .get(index)
            .and_then(|(_, v)| v.parse().ok())
            .ok_or(Unhandled)
    }

    pub(crate) fn set_parameters(&mut self, parameters: Vec<(String, String)>) {
        self.parameters = parameters;
    }

    /// Whether the peer asked to close the connection after this exchange.
    pub fn wants_close(&self) -> bool {
        self.headers.contains_token("Connection", "close")
    }
}

/// A response body.
pub enum Body {
    Empty,
    /// A buffered body, framed with `Content-Length`.
    Bytes(Vec<u8>),
    /// A streamed body, framed with `Transfer-Encoding: chunked`.
    Stream(Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>),
    /// Switch protocols: perform the WebSocket handshake and hand the
    /// connection to the given handler.
    Upgrade(Arc<dyn WsHandler>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
            Body::Upgrade(_) => f.write_str("Body::Upgrade"),
        }
    }
}

/// An HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    /// An empty response with the given status code.
    pub fn status(status: u16) -> Response {
        Response {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// A `200 OK` response with no body.
    pub fn ok() -> Response {
        Response::status(200)
    }

    /// A `200 OK` response with a text body.
    pub fn text(body: impl Into<String>) -> Response {
        let mut response = Response::status(200);
        response
            .headers
            .insert("Content-Type", "text/plain; charset=utf-8");
        response.body = Body::Bytes(body.into().into_bytes());
        response
    }

    /// A `200 OK` response with a chunked streaming body.
    pub fn stream(
        stream: impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    ) -> Response {
        let mut response = Response::status(200);
        response.body = Body::Stream(Box::pin(stream));
        response
    }

    /// A `101 Switching Protocols` upgrade to the given WebSocket handler.
    pub fn upgrade(handler: impl WsHandler + 'static) -> Response {
        let mut response = Response::status(101);
        response.body = Body::Upgrade(Arc::new(handler));
        response
    }

    pub fn not_found() -> Response {
        Response::status(404)
    }

    pub fn bad_request() -> Response {
        Response::status(400)
    }

    /// Adds a header and returns the response for chaining.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.headers.contains_token("Connection", "close")
    }
}

/// The canonical reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
