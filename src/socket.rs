//! Non-blocking BSD sockets.
//!
//! [`Socket`] wraps a descriptor in non-blocking mode and converts every
//! operation into a result that either makes progress or reports
//! [`SocketError::Blocked`]. Callers that hit `Blocked` are expected to
//! suspend on a [`SocketPool`][crate::pool::SocketPool] until the
//! descriptor is ready; [`AsyncSocket`][crate::async_socket::AsyncSocket]
//! does exactly that.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::sys::socket::{shutdown, Shutdown};

/// An address a server can listen on: IPv4, IPv6, or UNIX-domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// An internet address, v4 or v6.
    Inet(SocketAddr),
    /// A UNIX-domain socket path.
    Unix(PathBuf),
}

impl SocketAddress {
    /// Creates a UNIX-domain address.
    pub fn unix<P: AsRef<Path>>(path: P) -> SocketAddress {
        SocketAddress::Unix(path.as_ref().to_path_buf())
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> SocketAddress {
        SocketAddress::Inet(addr)
    }
}

impl std::str::FromStr for SocketAddress {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<SocketAddress, SocketError> {
        s.parse::<SocketAddr>()
            .map(SocketAddress::Inet)
            .map_err(|_| SocketError::UnsupportedAddress)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Inet(addr) => write!(f, "{}", addr),
            SocketAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Errors surfaced by socket operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The operation would block; the caller should suspend until ready.
    Blocked,
    /// The peer closed the connection or the descriptor was invalidated.
    Disconnected,
    /// The owning pool stopped or the task was cancelled.
    Cancelled,
    /// The address family or format is not supported.
    UnsupportedAddress,
    /// A system call failed.
    Failed {
        call: &'static str,
        errno: Option<i32>,
        message: String,
    },
}

impl SocketError {
    pub(crate) fn failed(call: &'static str, err: io::Error) -> SocketError {
        SocketError::Failed {
            call,
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub(crate) fn from_io(call: &'static str, err: io::Error) -> SocketError {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::Blocked,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SocketError::Disconnected,
            _ => SocketError::failed(call, err),
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Blocked => write!(f, "operation would block"),
            SocketError::Disconnected => write!(f, "peer disconnected"),
            SocketError::Cancelled => write!(f, "operation cancelled"),
            SocketError::UnsupportedAddress => write!(f, "unsupported address"),
            SocketError::Failed {
                call,
                errno,
                message,
            } => match errno {
                Some(errno) => write!(f, "{} failed (errno {}): {}", call, errno, message),
                None => write!(f, "{} failed: {}", call, message),
            },
        }
    }
}

impl std::error::Error for SocketError {}

impl From<SocketError> for io::Error {
    fn from(err: SocketError) -> io::Error {
        let kind = match err {
            SocketError::Blocked => io::ErrorKind::WouldBlock,
            SocketError::Disconnected => io::ErrorKind::ConnectionAborted,
            // Not `Interrupted`: I/O adapters retry that kind in a loop.
            SocketError::Cancelled => io::ErrorKind::Other,
            SocketError::UnsupportedAddress => io::ErrorKind::InvalidInput,
            SocketError::Failed { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// A non-blocking socket.
///
/// All operations take `&self`; the descriptor is owned by the wrapper and
/// closed exactly once when it drops. A listener bound to a UNIX-domain path
/// removes the path again on drop.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
    unix_path: Option<PathBuf>,
}

impl Socket {
    /// Creates a listening socket bound to `address`.
    ///
    /// `SO_REUSEADDR` is set on internet sockets. A stale UNIX socket path
    /// is unlinked before binding and removed again when the listener drops.
    pub fn listen(address: &SocketAddress, backlog: i32) -> Result<Socket, SocketError> {
        let socket = match address {
            SocketAddress::Inet(addr) => {
                let domain = if addr.is_ipv6() {
                    Domain::ipv6()
                } else {
                    Domain::ipv4()
                };
                let socket = socket2::Socket::new(domain, Type::stream(), Some(Protocol::tcp()))
                    .map_err(|e| SocketError::failed("socket", e))?;
                socket
                    .set_reuse_address(true)
                    .map_err(|e| SocketError::failed("setsockopt", e))?;
                socket
                    .bind(&SockAddr::from(*addr))
                    .map_err(|e| SocketError::failed("bind", e))?;
                Socket {
                    inner: socket,
                    unix_path: None,
                }
            }
            SocketAddress::Unix(path) => {
                let socket = socket2::Socket::new(Domain::unix(), Type::stream(), None)
                    .map_err(|e| SocketError::failed("socket", e))?;
                // A path left behind by a dead listener would fail the bind.
                let _ = std::fs::remove_file(path);
                let addr =
                    SockAddr::unix(path).map_err(|_| SocketError::UnsupportedAddress)?;
                socket
                    .bind(&addr)
                    .map_err(|e| SocketError::failed("bind", e))?;
                Socket {
                    inner: socket,
                    unix_path: Some(path.clone()),
                }
            }
        };

        socket
            .inner
            .listen(backlog)
            .map_err(|e| SocketError::failed("listen", e))?;
        socket
            .inner
            .set_nonblocking(true)
            .map_err(|e| SocketError::failed("fcntl", e))?;
        Ok(socket)
    }

    /// Accepts a pending connection, returning the peer socket already in
    /// non-blocking mode.
    pub fn accept(&self) -> Result<Socket, SocketError> {
        let (peer, _addr) = self
            .inner
            .accept()
            .map_err(|e| SocketError::from_io("accept", e))?;
        peer.set_nonblocking(true)
            .map_err(|e| SocketError::failed("fcntl", e))?;
        Ok(Socket {
            inner: peer,
            unix_path: None,
        })
    }

    /// Reads bytes from the socket. `Ok(0)` means the peer closed its end.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.inner
            .recv(buf)
            .map_err(|e| SocketError::from_io("recv", e))
    }

    /// Writes bytes to the socket, returning how many were taken.
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        self.inner
            .send(buf)
            .map_err(|e| SocketError::from_io("send", e))
    }

    /// Shuts down both directions. Waiters suspended on the descriptor
    /// observe end-of-file.
    pub fn shutdown(&self) {
        let _ = shutdown(self.as_raw_fd(), Shutdown::Both);
    }

    /// The address this socket is bound to.
    pub fn local_address(&self) -> Result<SocketAddress, SocketError> {
        if let Some(path) = &self.unix_path {
            return Ok(SocketAddress::Unix(path.clone()));
        }
        let addr = self
            .inner
            .local_addr()
            .map_err(|e| SocketError::failed("getsockname", e))?;
        if let Some(v4) = addr.as_inet() {
            Ok(SocketAddress::Inet(SocketAddr::V4(v4)))
        } else if let Some(v6) = addr.as_inet6() {
            Ok(SocketAddress::Inet(SocketAddr::V6(v6)))
        } else {
            Err(SocketError::UnsupportedAddress)
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_reports_bound_port() {
        let address: SocketAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::listen(&address, 16).unwrap();
        match listener.local_address().unwrap() {
            SocketAddress::Inet(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected address {}", other),
        }
    }

    #[test]
    fn accept_on_idle_listener_blocks() {
        let address: SocketAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::listen(&address, 16).unwrap();
        assert_eq!(listener.accept().unwrap_err(), SocketError::Blocked);
    }

    #[test]
    fn unix_listener_removes_path_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let listener = Socket::listen(&SocketAddress::unix(&path), 16).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
