//! The socket pool.
//!
//! A [`SocketPool`] owns one event queue backend and a *waiting table*
//! mapping `(fd, event)` to suspended callers. [`suspend`][SocketPool::suspend]
//! parks the calling task until the descriptor is ready for at least one of
//! the requested events; [`run`][SocketPool::run] is the long-lived driver
//! that fetches kernel notifications and resumes waiters.
//!
//! Each suspended caller is a token: a unique id plus the sending half of a
//! one-shot channel. Appending a token returns the *delta* of events that
//! went from zero waiters to at least one, and removing one returns the
//! delta that dropped back to zero; the deltas drive the backend's
//! registration so the kernel interest set is always exactly the union of
//! events across waiters per descriptor.
//!
//! Waiters for the same descriptor and event resume in the order they were
//! appended. When `run` exits for any reason, every remaining token resumes
//! with [`SocketError::Cancelled`].

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blocking::unblock;
use futures::channel::oneshot;
use futures_lite::future;
use log::{debug, trace};

use crate::queue::{
    EventQueue, EventSet, Notification, NotificationErrors, PoolBackend, QueueError,
};
use crate::socket::SocketError;

/// Default kernel notification batch size.
pub(crate) const DEFAULT_MAX_EVENTS: usize = 20;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`SocketPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// Errors returned by [`SocketPool::prepare`] and [`SocketPool::run`].
#[derive(Debug)]
pub enum PoolError {
    /// The operation is not valid in the pool's current state.
    InvalidState(PoolState),
    /// The backend failed.
    Queue(std::io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidState(state) => write!(f, "invalid pool state: {:?}", state),
            PoolError::Queue(err) => write!(f, "event queue failed: {}", err),
        }
    }
}

impl std::error::Error for PoolError {}

/// One suspended caller.
struct Waiter {
    token: u64,
    events: EventSet,
    sender: oneshot::Sender<Result<(), SocketError>>,
}

/// Per-descriptor waiter lists, in append order.
#[derive(Default)]
struct WaitingTable {
    entries: HashMap<RawFd, Vec<Waiter>>,
}

impl WaitingTable {
    fn union(&self, fd: RawFd) -> EventSet {
        self.entries
            .get(&fd)
            .map(|waiters| {
                waiters
                    .iter()
                    .fold(EventSet::empty(), |set, w| set | w.events)
            })
            .unwrap_or(EventSet::empty())
    }

    /// Appends a waiter and returns the events newly required for `fd`.
    fn append(&mut self, fd: RawFd, waiter: Waiter) -> EventSet {
        let before = self.union(fd);
        self.entries.entry(fd).or_insert_with(Vec::new).push(waiter);
        let after = self.union(fd);
        after - before
    }

    /// Removes the waiter with `token`, returning it together with the
    /// events no longer required for `fd`.
    fn remove(&mut self, fd: RawFd, token: u64) -> Option<(Waiter, EventSet)> {
        let index = self
            .entries
            .get(&fd)?
            .iter()
            .position(|w| w.token == token)?;
        let before = self.union(fd);
        let waiters = self.entries.get_mut(&fd).unwrap();
        let waiter = waiters.remove(index);
        let now_empty = waiters.is_empty();
        if now_empty {
            self.entries.remove(&fd);
        }
        let after = self.union(fd);
        Some((waiter, before - after))
    }

    /// Removes every waiter for `fd` interested in any of `events`,
    /// preserving append order, and returns them with the removed delta.
    fn take_matching(&mut self, fd: RawFd, events: EventSet) -> (Vec<Waiter>, EventSet) {
        let before = self.union(fd);
        let mut resumed = Vec::new();
        if let Some(waiters) = self.entries.get_mut(&fd) {
            let mut index = 0;
            while index < waiters.len() {
                if !(waiters[index].events & events).is_empty() {
                    resumed.push(waiters.remove(index));
                } else {
                    index += 1;
                }
            }
            if waiters.is_empty() {
                self.entries.remove(&fd);
            }
        }
        let after = self.union(fd);
        (resumed, before - after)
    }

    /// Removes everything, returning waiters grouped with their per-fd
    /// registration unions.
    fn drain(&mut self) -> Vec<(RawFd, EventSet, Vec<Waiter>)> {
        self.entries
            .drain()
            .map(|(fd, waiters)| {
                let union = waiters
                    .iter()
                    .fold(EventSet::empty(), |set, w| set | w.events);
                (fd, union, waiters)
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Inner {
    state: PoolState,
    table: WaitingTable,
    queue: Option<Arc<EventQueue>>,
}

/// A readiness multiplexer that parks and wakes cooperative tasks.
///
/// The pool is shared behind an [`Arc`]: the driver calls [`run`][Self::run]
/// from one task while any number of other tasks call
/// [`suspend`][Self::suspend] concurrently.
pub struct SocketPool {
    inner: Mutex<Inner>,
    backend: PoolBackend,
    max_events: usize,
}

impl SocketPool {
    /// Creates a pool that will drive the given backend.
    pub fn new(backend: PoolBackend) -> SocketPool {
        SocketPool {
            inner: Mutex::new(Inner {
                state: PoolState::Uninitialized,
                table: WaitingTable::default(),
                queue: None,
            }),
            backend,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// Sets the kernel notification batch size.
    pub fn with_max_events(mut self, max_events: usize) -> SocketPool {
        self.max_events = max_events.max(1);
        self
    }

    /// The pool's current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.inner.lock().unwrap().state
    }

    /// Opens the backend and transitions to `Ready`.
    ///
    /// Re-opening after `Stopped` is permitted.
    pub fn prepare(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            PoolState::Uninitialized | PoolState::Stopped => {
                let queue = EventQueue::open(self.backend).map_err(PoolError::Queue)?;
                inner.queue = Some(Arc::new(queue));
                inner.state = PoolState::Ready;
                Ok(())
            }
            PoolState::Ready => Ok(()),
            state => Err(PoolError::InvalidState(state)),
        }
    }

    /// Drives the pool until it is stopped or the backend fails.
    ///
    /// Requires `Ready`. On exit every pending token is resumed with
    /// [`SocketError::Cancelled`] — including when the returned future is
    /// dropped mid-flight.
    pub async fn run(&self) -> Result<(), PoolError> {
        let queue = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != PoolState::Ready {
                return Err(PoolError::InvalidState(inner.state));
            }
            inner.state = PoolState::Running;
            inner.queue.clone().expect("ready pool has a queue")
        };
        debug!("socket pool running");

        let _guard = RunGuard { pool: self };
        loop {
            let batch = {
                let queue = queue.clone();
                let max_events = self.max_events;
                unblock(move || queue.get_notifications(max_events)).await
            };
            match batch {
                Ok(notifications) => {
                    for notification in notifications {
                        self.process(&queue, notification);
                    }
                }
                Err(QueueError::Disconnected) => {
                    debug!("socket pool stopping");
                    return Ok(());
                }
                Err(QueueError::Io(err)) => {
                    debug!("socket pool failed: {}", err);
                    return Err(PoolError::Queue(err));
                }
            }
            // Let other tasks make progress between batches.
            future::yield_now().await;
        }
    }

    /// Stops the pool, unblocking the driver and failing new suspensions.
    pub fn stop(&self) {
        let queue = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                PoolState::Running => inner.state = PoolState::Stopping,
                PoolState::Ready | PoolState::Uninitialized => {
                    inner.state = PoolState::Stopped;
                    inner.queue = None;
                    return;
                }
                PoolState::Stopping | PoolState::Stopped => return,
            }
            inner.queue.clone()
        };
        if let Some(queue) = queue {
            queue.stop();
        }
    }

    /// Suspends the calling task until `fd` is ready for at least one event
    /// in `events`, or until the pool stops.
    ///
    /// Dropping the returned future removes the token and, if that empties
    /// an event's waiter list, deregisters the event before unwinding.
    pub async fn suspend(&self, fd: RawFd, events: EventSet) -> Result<(), SocketError> {
        let (sender, receiver) = oneshot::channel();
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                PoolState::Ready | PoolState::Running => {}
                _ => return Err(SocketError::Cancelled),
            }
            let delta = inner.table.append(
                fd,
                Waiter {
                    token,
                    events,
                    sender,
                },
            );
            if !delta.is_empty() {
                let queue = inner.queue.clone().expect("live pool has a queue");
                if let Err(err) = queue.add_events(fd, delta) {
                    inner.table.remove(fd, token);
                    return Err(SocketError::failed("add_events", err));
                }
            }
        }
        trace!("fd {} suspended on {:?} (token {})", fd, events, token);

        let mut guard = SuspendGuard {
            pool: Some(self),
            fd,
            token,
        };
        let result = match receiver.await {
            Ok(result) => result,
            // The pool dropped the sender without resuming; treat as stop.
            Err(oneshot::Canceled) => Err(SocketError::Cancelled),
        };
        guard.disarm();
        result
    }

    /// Resumes waiters for one notification inside a single critical
    /// section; the one-shot sends happen outside the table mutex.
    fn process(&self, queue: &EventQueue, notification: Notification) {
        let Notification { fd, events, errors } = notification;
        trace!("fd {} ready: {:?} errors {:?}", fd, events, errors);

        let resumed = {
            let mut inner = self.inner.lock().unwrap();
            let (resumed, removed) = inner.table.take_matching(fd, events);
            if !removed.is_empty() {
                let _ = queue.remove_events(fd, removed);
            }
            resumed
        };

        let result = if errors.is_empty() {
            Ok(())
        } else if errors.contains(NotificationErrors::END_OF_FILE) {
            Err(SocketError::Disconnected)
        } else {
            Err(SocketError::Failed {
                call: "wait",
                errno: None,
                message: "error condition on descriptor".into(),
            })
        };
        for waiter in resumed {
            let _ = waiter.sender.send(result.clone());
        }
    }

    /// Cancellation path: removes a token and trims the registration.
    fn cancel_token(&self, fd: RawFd, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_waiter, delta)) = inner.table.remove(fd, token) {
            if !delta.is_empty() {
                if let Some(queue) = inner.queue.clone() {
                    let _ = queue.remove_events(fd, delta);
                }
            }
        }
    }

    /// Driver-exit path: resumes everything with `Cancelled`.
    fn shut_down(&self) {
        let (drained, queue) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = PoolState::Stopped;
            (inner.table.drain(), inner.queue.take())
        };
        if let Some(queue) = &queue {
            // Unblock an orphaned kernel wait still holding the queue.
            queue.stop();
            for (fd, union, _) in &drained {
                let _ = queue.remove_events(*fd, *union);
            }
        }
        for (_, _, waiters) in drained {
            for waiter in waiters {
                let _ = waiter.sender.send(Err(SocketError::Cancelled));
            }
        }
    }
}

impl fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketPool")
            .field("state", &self.state())
            .finish()
    }
}

struct SuspendGuard<'a> {
    pool: Option<&'a SocketPool>,
    fd: RawFd,
    token: u64,
}

impl SuspendGuard<'_> {
    fn disarm(&mut self) {
        self.pool = None;
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.cancel_token(self.fd, self.token);
        }
    }
}

struct RunGuard<'a> {
    pool: &'a SocketPool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.pool.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(token: u64, events: EventSet) -> (Waiter, oneshot::Receiver<Result<(), SocketError>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Waiter {
                token,
                events,
                sender,
            },
            receiver,
        )
    }

    #[test]
    fn append_returns_delta_only_for_new_events() {
        let mut table = WaitingTable::default();
        let (first, _r1) = waiter(1, EventSet::READ);
        assert_eq!(table.append(4, first), EventSet::READ);

        let (second, _r2) = waiter(2, EventSet::READ);
        assert_eq!(table.append(4, second), EventSet::empty());

        let (third, _r3) = waiter(3, EventSet::CONNECTION);
        assert_eq!(table.append(4, third), EventSet::WRITE);
    }

    #[test]
    fn remove_returns_delta_when_last_waiter_leaves() {
        let mut table = WaitingTable::default();
        let (first, _r1) = waiter(1, EventSet::READ);
        let (second, _r2) = waiter(2, EventSet::CONNECTION);
        table.append(4, first);
        table.append(4, second);

        let (_, delta) = table.remove(4, 2).unwrap();
        assert_eq!(delta, EventSet::WRITE);

        let (_, delta) = table.remove(4, 1).unwrap();
        assert_eq!(delta, EventSet::READ);
        assert!(table.is_empty());
    }

    #[test]
    fn take_matching_preserves_append_order() {
        let mut table = WaitingTable::default();
        for token in 1..=3 {
            let (w, r) = waiter(token, EventSet::READ);
            table.append(4, w);
            std::mem::forget(r);
        }
        let (w, _r) = waiter(9, EventSet::WRITE);
        table.append(4, w);

        let (resumed, removed) = table.take_matching(4, EventSet::READ);
        assert_eq!(
            resumed.iter().map(|w| w.token).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(removed, EventSet::READ);
        assert_eq!(table.union(4), EventSet::WRITE);
    }

    #[test]
    fn table_empty_iff_no_outstanding_tokens() {
        let mut table = WaitingTable::default();
        assert!(table.is_empty());
        let (w, _r) = waiter(1, EventSet::READ);
        table.append(5, w);
        assert!(!table.is_empty());
        table.take_matching(5, EventSet::READ);
        assert!(table.is_empty());
    }

    #[test]
    fn run_requires_ready() {
        let pool = Arc::new(SocketPool::new(PoolBackend::Auto));
        let result = futures_lite::future::block_on(pool.run());
        assert!(matches!(
            result,
            Err(PoolError::InvalidState(PoolState::Uninitialized))
        ));
    }

    #[test]
    fn suspend_after_stop_fails_immediately() {
        let pool = Arc::new(SocketPool::new(PoolBackend::Auto));
        pool.prepare().unwrap();
        pool.stop();
        let result = futures_lite::future::block_on(pool.suspend(0, EventSet::READ));
        assert_eq!(result, Err(SocketError::Cancelled));
    }
}
