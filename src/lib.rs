//! A small HTTP/1.1 server built on a user-space readiness multiplexer.
//!
//! This library provides:
//!
//! * A [`SocketPool`]: non-blocking sockets registered with epoll, kqueue,
//!   or a userland `poll(2)` scanner, turned into suspend/resume primitives
//!   for cooperative tasks.
//! * An HTTP/1.1 connection loop with incremental parsing, keep-alive,
//!   pipelining, and chunked transfer in both directions.
//! * An ordered [`Route`] table with wildcard and capture path patterns,
//!   query, header, and body predicates.
//! * WebSocket upgrades with a full RFC 6455 framer.
//!
//! # Examples
//!
//! A server that greets by name:
//!
//! ```no_run
//! use tern::{Response, Server, Unhandled};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080")?;
//!
//!     server.route("GET /hello/:name", |req: tern::Request| async move {
//!         let name: String = req.parameter("name")?;
//!         Ok::<_, Unhandled>(Response::text(format!("hello, {}", name)))
//!     })?;
//!
//!     tern::block_on(server.start())?;
//!     Ok(())
//! }
//! ```
//!
//! A WebSocket echo server is one route more:
//!
//! ```no_run
//! # use tern::{MessageStream, Response, Server, Unhandled};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let server = Server::bind("127.0.0.1:8080")?;
//! server.route("GET /socket", |_req: tern::Request| async move {
//!     Ok::<_, Unhandled>(Response::upgrade(|incoming: MessageStream| incoming))
//! })?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

#[cfg(not(unix))]
compile_error!("this crate targets Unix platforms (epoll, kqueue, or poll)");

mod async_socket;
mod codec;
mod connection;
mod handler;
mod http;
mod pool;
mod queue;
mod route;
mod server;
mod socket;
mod spawn;
mod sys;
mod websocket;

pub use async_socket::AsyncSocket;
pub use codec::{HttpError, Limits};
pub use handler::{Handler, Unhandled};
pub use http::{reason_phrase, Body, Headers, Method, Request, Response};
pub use pool::{PoolError, PoolState, SocketPool};
pub use queue::{EventSet, Notification, NotificationErrors, PoolBackend};
pub use route::{Route, RouteParseError, Segment, ValuePattern};
pub use server::{RouteTable, Server, ServerConfig, ServerError};
pub use socket::{Socket, SocketAddress, SocketError};
pub use spawn::spawn;
pub use websocket::{Message, MessageStream, WsError, WsHandler};

/// Blocks the current thread on a future.
///
/// Executor threads are started lazily by [`spawn`]; `block_on` itself only
/// drives the given future.
pub use futures_lite::future::block_on;

/// The `Task` type returned by [`spawn`]: cancelled when dropped, detachable
/// to keep running in the background.
pub use async_executor::Task;
