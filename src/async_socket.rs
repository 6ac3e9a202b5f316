//! Pool-bound async sockets.
//!
//! [`AsyncSocket`] binds a non-blocking [`Socket`] to a
//! [`SocketPool`]: every operation is attempted directly and, on
//! [`SocketError::Blocked`], the calling task suspends on the pool until the
//! descriptor is ready, then retries.
//!
//! The type also implements [`AsyncRead`] and [`AsyncWrite`] so the
//! `futures` ecosystem of adapters (buffered readers, `read_until`,
//! `write_all`, ...) applies directly. Because a suspension here is a token
//! with a one-shot channel rather than a waker registration, the in-flight
//! suspension future is stored across polls instead of being re-created on
//! every call.

use std::future::Future;
use std::io;
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures_lite::io::{AsyncRead, AsyncWrite};

use crate::pool::SocketPool;
use crate::queue::EventSet;
use crate::socket::{Socket, SocketError};

/// A non-blocking socket bound to a pool.
///
/// Cloning yields a second handle to the same descriptor with its own
/// suspension state; reads and writes may then proceed from different tasks.
pub struct AsyncSocket {
    socket: Arc<Socket>,
    pool: Arc<SocketPool>,
    readable: Option<BoxFuture<'static, Result<(), SocketError>>>,
    writable: Option<BoxFuture<'static, Result<(), SocketError>>>,
}

impl AsyncSocket {
    /// Binds `socket` (already in non-blocking mode) to `pool`.
    pub fn new(socket: Socket, pool: Arc<SocketPool>) -> AsyncSocket {
        AsyncSocket {
            socket: Arc::new(socket),
            pool,
            readable: None,
            writable: None,
        }
    }

    /// A reference to the underlying socket.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// The pool this socket suspends on.
    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    /// Runs a non-blocking operation, suspending on `Blocked` until the
    /// descriptor is readable.
    pub async fn read_with<R>(
        &self,
        mut op: impl FnMut(&Socket) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        loop {
            match op(&self.socket) {
                Err(SocketError::Blocked) => {}
                res => return res,
            }
            self.pool
                .suspend(self.socket.as_raw_fd(), EventSet::READ)
                .await?;
        }
    }

    /// Runs a non-blocking operation, suspending on `Blocked` until the
    /// descriptor is writable.
    pub async fn write_with<R>(
        &self,
        mut op: impl FnMut(&Socket) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        loop {
            match op(&self.socket) {
                Err(SocketError::Blocked) => {}
                res => return res,
            }
            self.pool
                .suspend(self.socket.as_raw_fd(), EventSet::WRITE)
                .await?;
        }
    }

    /// Accepts a connection on a listening socket.
    pub async fn accept(&self) -> Result<AsyncSocket, SocketError> {
        let peer = self.read_with(|socket| socket.accept()).await?;
        Ok(AsyncSocket::new(peer, self.pool.clone()))
    }

    fn poll_io<R>(
        &mut self,
        cx: &mut Context<'_>,
        events: EventSet,
        mut op: impl FnMut(&Socket) -> Result<R, SocketError>,
    ) -> Poll<io::Result<R>> {
        loop {
            match op(&self.socket) {
                Err(SocketError::Blocked) => {}
                Ok(value) => {
                    self.slot(events).take();
                    return Poll::Ready(Ok(value));
                }
                Err(err) => {
                    self.slot(events).take();
                    return Poll::Ready(Err(err.into()));
                }
            }

            let fd = self.socket.as_raw_fd();
            let pool = self.pool.clone();
            let suspend = self
                .slot(events)
                .get_or_insert_with(|| Box::pin(async move { pool.suspend(fd, events).await }));
            match suspend.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.slot(events).take();
                }
                Poll::Ready(Err(err)) => {
                    self.slot(events).take();
                    return Poll::Ready(Err(err.into()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn slot(
        &mut self,
        events: EventSet,
    ) -> &mut Option<BoxFuture<'static, Result<(), SocketError>>> {
        if events == EventSet::READ {
            &mut self.readable
        } else {
            &mut self.writable
        }
    }
}

impl std::fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

impl Clone for AsyncSocket {
    fn clone(&self) -> AsyncSocket {
        AsyncSocket {
            socket: self.socket.clone(),
            pool: self.pool.clone(),
            readable: None,
            writable: None,
        }
    }
}

impl AsyncRead for AsyncSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_io(cx, EventSet::READ, |socket| socket.recv(buf))
    }
}

impl AsyncWrite for AsyncSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_io(cx, EventSet::WRITE, |socket| socket.send(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Sends go straight to the kernel; there is nothing buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
