//! The HTTP server.
//!
//! [`Server::start`] binds the configured address and then runs two
//! concurrent subtasks: the pool driver and an accept loop. Every accepted
//! connection becomes a detached task; the server only keeps a weak handle
//! to its socket so a graceful stop can force stragglers closed.
//!
//! `start` is cancel-safe: all listening and connection state is owned by
//! its future, so dropping it closes the listener and collapses the pool,
//! which resumes every suspended connection task with `Cancelled`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use blocking::unblock;
use futures::channel::oneshot;
use futures_lite::future;
use log::{debug, info, warn};
use slab::Slab;

use crate::async_socket::AsyncSocket;
use crate::codec::Limits;
use crate::connection::serve_connection;
use crate::handler::Handler;
use crate::pool::{PoolError, SocketPool};
use crate::queue::PoolBackend;
use crate::route::{Route, RouteParseError};
use crate::socket::{Socket, SocketAddress, SocketError};

const ACCEPT_BACKLOG: i32 = 128;

/// Errors surfaced by [`Server::start`] and [`Server::wait_until_listening`].
#[derive(Debug)]
pub enum ServerError {
    /// Binding or listening failed.
    Bind(SocketError),
    /// The socket pool failed.
    Pool(PoolError),
    /// The server stopped before the awaited state was reached.
    Stopped,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(err) => write!(f, "bind failed: {}", err),
            ServerError::Pool(err) => write!(f, "socket pool failed: {}", err),
            ServerError::Stopped => f.write_str("server stopped"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The address to bind: IPv4, IPv6, or UNIX-domain.
    pub address: SocketAddress,
    /// Which readiness backend the pool drives.
    pub backend: PoolBackend,
    /// Kernel notification batch size.
    pub max_events: usize,
    /// Grace period [`Server::stop`] allows in-flight requests.
    pub stop_timeout: Duration,
    /// HTTP parsing limits.
    pub limits: Limits,
}

impl ServerConfig {
    pub fn new(address: impl Into<SocketAddress>) -> ServerConfig {
        ServerConfig {
            address: address.into(),
            backend: PoolBackend::Auto,
            max_events: crate::pool::DEFAULT_MAX_EVENTS,
            stop_timeout: Duration::from_secs(10),
            limits: Limits::default(),
        }
    }

    pub fn with_backend(mut self, backend: PoolBackend) -> ServerConfig {
        self.backend = backend;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> ServerConfig {
        self.max_events = max_events;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> ServerConfig {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> ServerConfig {
        self.limits = limits;
        self
    }
}

/// The ordered route table.
///
/// Appending while serving is supported; each request dispatches against a
/// consistent snapshot taken when its head has been parsed.
pub struct RouteTable {
    entries: RwLock<Arc<Vec<(Route, Arc<dyn Handler>)>>>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("len", &self.snapshot().len())
            .finish()
    }
}

impl RouteTable {
    fn new() -> RouteTable {
        RouteTable {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Appends a route; copy-on-write so readers never block.
    pub fn append(&self, route: Route, handler: Arc<dyn Handler>) {
        let mut entries = self.entries.write().unwrap();
        let mut next = Vec::clone(&entries);
        next.push((route, handler));
        *entries = Arc::new(next);
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<(Route, Arc<dyn Handler>)>> {
        self.entries.read().unwrap().clone()
    }
}

struct Shared {
    listening: Option<SocketAddress>,
    listen_waiters: Vec<oneshot::Sender<SocketAddress>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    stop_signal: Option<oneshot::Sender<()>>,
    stop_timeout: Option<Duration>,
}

/// A lightweight HTTP/1.1 server.
///
/// ```no_run
/// use tern::{Response, Server, ServerConfig, Unhandled};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind("127.0.0.1:8080")?;
/// server.route("GET /hello", |_req: tern::Request| async move {
///     Ok::<_, Unhandled>(Response::text("hi"))
/// })?;
/// tern::block_on(server.start())?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    pool: Arc<SocketPool>,
    routes: Arc<RouteTable>,
    shared: Mutex<Shared>,
    stopping: Arc<AtomicBool>,
    connections: Arc<Mutex<Slab<std::sync::Weak<Socket>>>>,
}

impl Server {
    /// Creates a server from a configuration.
    pub fn new(config: ServerConfig) -> Server {
        let pool = SocketPool::new(config.backend).with_max_events(config.max_events);
        Server {
            config,
            pool: Arc::new(pool),
            routes: Arc::new(RouteTable::new()),
            shared: Mutex::new(Shared {
                listening: None,
                listen_waiters: Vec::new(),
                stop_waiters: Vec::new(),
                stop_signal: None,
                stop_timeout: None,
            }),
            stopping: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(Mutex::new(Slab::new())),
        }
    }

    /// Creates a server listening on an internet address given as a string.
    pub fn bind(address: &str) -> Result<Server, SocketError> {
        let address: SocketAddress = address.parse()?;
        Ok(Server::new(ServerConfig::new(address)))
    }

    /// The pool this server drives; exposed so embedders can suspend on it.
    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    /// Appends a route parsed from `pattern`.
    ///
    /// Routes may be appended at any time, including while serving.
    pub fn route(
        &self,
        pattern: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), RouteParseError> {
        let route: Route = pattern.parse()?;
        self.append_route(route, handler);
        Ok(())
    }

    /// Appends an already-built route.
    pub fn append_route(&self, route: Route, handler: impl Handler + 'static) {
        self.routes.append(route, Arc::new(handler));
    }

    /// Resolves once the server enters the listening state, with the actual
    /// bound address (useful when binding port `0`).
    pub async fn wait_until_listening(&self) -> Result<SocketAddress, ServerError> {
        let receiver = {
            let mut shared = self.shared.lock().unwrap();
            if let Some(address) = &shared.listening {
                return Ok(address.clone());
            }
            let (sender, receiver) = oneshot::channel();
            shared.listen_waiters.push(sender);
            receiver
        };
        receiver.await.map_err(|_| ServerError::Stopped)
    }

    /// Binds the address and serves until stopped.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.stopping.store(false, Ordering::SeqCst);
        self.pool.prepare().map_err(ServerError::Pool)?;

        let listener = Socket::listen(&self.config.address, ACCEPT_BACKLOG)
            .map_err(ServerError::Bind)?;
        let local = listener.local_address().map_err(ServerError::Bind)?;
        let listener = AsyncSocket::new(listener, self.pool.clone());
        info!("listening on {}", local);

        let stop_signal = {
            let mut shared = self.shared.lock().unwrap();
            shared.listening = Some(local.clone());
            for waiter in shared.listen_waiters.drain(..) {
                let _ = waiter.send(local.clone());
            }
            let (sender, receiver) = oneshot::channel();
            shared.stop_signal = Some(sender);
            receiver
        };
        let _exit = ExitGuard { server: self };

        let driver = async {
            self.pool.run().await.map_err(ServerError::Pool)?;
            Ok(())
        };
        let serve = async {
            // A stop requested before the listening state was published
            // must not be lost.
            if !self.stopping.load(Ordering::SeqCst) {
                let accept = async {
                    loop {
                        match listener.accept().await {
                            Ok(socket) => self.spawn_connection(socket),
                            Err(SocketError::Cancelled) => break,
                            Err(err) => {
                                // Transient failures (e.g. the peer aborted
                                // before accept) should not kill the server.
                                warn!("accept failed: {}", err);
                                future::yield_now().await;
                            }
                        }
                    }
                };
                future::race(accept, async {
                    let _ = stop_signal.await;
                })
                .await;
            }
            drop(listener);

            let timeout = self
                .shared
                .lock()
                .unwrap()
                .stop_timeout
                .unwrap_or(self.config.stop_timeout);
            self.drain_connections(timeout).await;
            Ok::<(), ServerError>(())
        };

        let result = future::race(driver, serve).await;
        self.pool.stop();
        result
    }

    /// Stops the server using the configured grace period.
    ///
    /// Accepting stops immediately; connection tasks finish their in-flight
    /// request; after the grace period surviving sockets are forced closed.
    /// Resolves when [`start`][Self::start] has returned.
    pub async fn stop(&self) {
        self.stop_within(self.config.stop_timeout).await
    }

    /// Stops the server with an explicit grace period.
    pub async fn stop_within(&self, timeout: Duration) {
        let receiver = {
            let mut shared = self.shared.lock().unwrap();
            self.stopping.store(true, Ordering::SeqCst);
            shared.stop_timeout = Some(timeout);
            if let Some(signal) = shared.stop_signal.take() {
                let _ = signal.send(());
            } else if shared.listening.is_none() {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            shared.stop_waiters.push(sender);
            receiver
        };
        let _ = receiver.await;
    }

    fn spawn_connection(&self, socket: AsyncSocket) {
        let key = self
            .connections
            .lock()
            .unwrap()
            .insert(Arc::downgrade(socket.socket()));
        debug!("accepted connection ({} open)", self.connections.lock().unwrap().len());

        let routes = self.routes.clone();
        let limits = self.config.limits;
        let stopping = self.stopping.clone();
        let connections = self.connections.clone();
        crate::spawn(async move {
            serve_connection(socket, routes, limits, stopping).await;
            connections.lock().unwrap().try_remove(key);
        })
        .detach();
    }

    /// Grace period, then force-close whatever is still open. Shutting a
    /// socket down wakes its suspended waiters with end-of-file.
    async fn drain_connections(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let live = {
                let mut connections = self.connections.lock().unwrap();
                connections.retain(|_, weak| weak.upgrade().is_some());
                connections.len()
            };
            if live == 0 {
                return;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let step = (deadline - now).min(Duration::from_millis(50));
            unblock(move || std::thread::sleep(step)).await;
        }

        let survivors: Vec<_> = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        if !survivors.is_empty() {
            debug!("forcing {} connection(s) closed", survivors.len());
            for socket in survivors {
                socket.shutdown();
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.address)
            .field("listening", &self.shared.lock().unwrap().listening)
            .finish()
    }
}

/// Runs when `start` exits or is cancelled: clears the listening state and
/// releases everyone waiting on `stop`.
struct ExitGuard<'a> {
    server: &'a Server,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut shared = self.server.shared.lock().unwrap();
        shared.listening = None;
        shared.stop_signal = None;
        shared.listen_waiters.clear();
        for waiter in shared.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
