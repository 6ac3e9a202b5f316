//! Request handlers.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;

use crate::http::{Request, Response};

/// Signals that a matched handler declines the request.
///
/// Matching continues with the next route; the peer never sees this error.
/// If every matching handler declines, the server responds `404`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unhandled;

impl fmt::Display for Unhandled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request not handled")
    }
}

impl std::error::Error for Unhandled {}

/// Something that can turn a request into a response.
///
/// Implemented for async closures:
///
/// ```
/// use tern::{Handler, Request, Response, Unhandled};
///
/// let handler = |_request: Request| async move {
///     Ok::<_, Unhandled>(Response::text("hi"))
/// };
/// let _: &dyn Handler = &handler;
/// ```
pub trait Handler: Send + Sync {
    fn handle(&self, request: Request) -> BoxFuture<'static, Result<Response, Unhandled>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, Unhandled>> + Send + 'static,
{
    fn handle(&self, request: Request) -> BoxFuture<'static, Result<Response, Unhandled>> {
        Box::pin(self(request))
    }
}
