//! Event queue backends.
//!
//! An [`EventQueue`] watches a set of file descriptors and reports readiness.
//! Three interchangeable backends implement the same contract:
//!
//! * **epoll** on Linux/Android, in edge-triggered mode.
//! * **kqueue** on macOS/iOS/BSD, with `EV_CLEAR` filters.
//! * **poll** everywhere: a pure-userland scanner over a snapshot of the
//!   registered descriptors.
//!
//! The kernel's interest set for a descriptor always equals the union of
//! events requested through [`add_events`][EventQueue::add_events] /
//! [`remove_events`][EventQueue::remove_events]. A queue is stopped by
//! signalling a canary (an `eventfd` on Linux, an `EVFILT_USER` event on
//! kqueue, an atomic flag in the poll scanner), which makes the blocking
//! [`get_notifications`][EventQueue::get_notifications] call fail with
//! [`QueueError::Disconnected`] and unblocks the pool driver.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;
mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::EpollQueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
use kqueue::KqueueQueue;
use poll::PollQueue;

/// Default interval the poll scanner blocks in `poll(2)`.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default interval after which the poll scanner returns an empty batch so
/// the driver task can yield cooperatively.
pub(crate) const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(50);

bitflags::bitflags! {
    /// A set of I/O events on a file descriptor.
    pub struct EventSet: u8 {
        /// The descriptor is ready for reading.
        const READ = 0b01;
        /// The descriptor is ready for writing.
        const WRITE = 0b10;
        /// Both directions; the interest set of a freshly accepted connection.
        const CONNECTION = Self::READ.bits | Self::WRITE.bits;
    }
}

bitflags::bitflags! {
    /// Error conditions reported alongside readiness.
    pub struct NotificationErrors: u8 {
        /// The peer closed its end of the descriptor.
        const END_OF_FILE = 0b01;
        /// The kernel flagged an error condition on the descriptor.
        const ERROR = 0b10;
    }
}

/// A single readiness report for one file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub fd: RawFd,
    pub events: EventSet,
    pub errors: NotificationErrors,
}

/// Errors produced by a queue backend.
#[derive(Debug)]
pub enum QueueError {
    /// The stop canary fired; the queue is shutting down.
    Disconnected,
    /// A kernel interface failed.
    Io(io::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Disconnected => write!(f, "event queue disconnected"),
            QueueError::Io(err) => write!(f, "event queue error: {}", err),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<io::Error> for QueueError {
    fn from(err: io::Error) -> QueueError {
        QueueError::Io(err)
    }
}

/// Which backend a [`SocketPool`][crate::pool::SocketPool] should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBackend {
    /// kqueue on Darwin/BSD, epoll on Linux, poll elsewhere.
    Auto,
    /// Force the kernel event queue for this platform.
    KernelQueue,
    /// Force the userland poll scanner.
    Poll {
        /// How long one `poll(2)` call may block.
        poll_interval: Duration,
        /// How long to keep scanning before handing control back to the
        /// driver without any readiness.
        loop_interval: Duration,
    },
}

impl PoolBackend {
    /// The userland poll scanner with its default intervals.
    pub fn poll() -> PoolBackend {
        PoolBackend::Poll {
            poll_interval: DEFAULT_POLL_INTERVAL,
            loop_interval: DEFAULT_LOOP_INTERVAL,
        }
    }
}

impl Default for PoolBackend {
    fn default() -> PoolBackend {
        PoolBackend::Auto
    }
}

/// A readiness queue over one of the platform backends.
pub(crate) enum EventQueue {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(EpollQueue),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    Kqueue(KqueueQueue),
    Poll(PollQueue),
}

impl EventQueue {
    /// Opens a queue of the requested kind.
    pub fn open(backend: PoolBackend) -> io::Result<EventQueue> {
        match backend {
            PoolBackend::Auto | PoolBackend::KernelQueue => Self::open_kernel(backend),
            PoolBackend::Poll {
                poll_interval,
                loop_interval,
            } => Ok(EventQueue::Poll(PollQueue::new(poll_interval, loop_interval))),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn open_kernel(_backend: PoolBackend) -> io::Result<EventQueue> {
        Ok(EventQueue::Epoll(EpollQueue::open()?))
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    fn open_kernel(_backend: PoolBackend) -> io::Result<EventQueue> {
        Ok(EventQueue::Kqueue(KqueueQueue::open()?))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    )))]
    fn open_kernel(backend: PoolBackend) -> io::Result<EventQueue> {
        match backend {
            PoolBackend::KernelQueue => Err(io::Error::new(
                io::ErrorKind::Other,
                "no kernel event queue on this platform",
            )),
            _ => Ok(EventQueue::Poll(PollQueue::new(
                DEFAULT_POLL_INTERVAL,
                DEFAULT_LOOP_INTERVAL,
            ))),
        }
    }

    /// Extends the kernel interest set for `fd` by `events`.
    pub fn add_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            EventQueue::Epoll(q) => q.add_events(fd, events),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            EventQueue::Kqueue(q) => q.add_events(fd, events),
            EventQueue::Poll(q) => q.add_events(fd, events),
        }
    }

    /// Shrinks the kernel interest set for `fd` by `events`.
    pub fn remove_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            EventQueue::Epoll(q) => q.remove_events(fd, events),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            EventQueue::Kqueue(q) => q.remove_events(fd, events),
            EventQueue::Poll(q) => q.remove_events(fd, events),
        }
    }

    /// Blocks until at least one notification is available, the queue is
    /// stopped, or (poll backend only) the loop interval elapses.
    ///
    /// At most `max` notifications are returned per call. An empty batch is
    /// not an error; it only means the caller should yield and try again.
    pub fn get_notifications(&self, max: usize) -> Result<Vec<Notification>, QueueError> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            EventQueue::Epoll(q) => q.get_notifications(max),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            EventQueue::Kqueue(q) => q.get_notifications(max),
            EventQueue::Poll(q) => q.get_notifications(max),
        }
    }

    /// Signals the stop canary.
    pub fn stop(&self) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            EventQueue::Epoll(q) => q.stop(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            EventQueue::Kqueue(q) => q.stop(),
            EventQueue::Poll(q) => q.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_set_ops() {
        let connection = EventSet::READ | EventSet::WRITE;
        assert_eq!(connection, EventSet::CONNECTION);
        assert!(connection.contains(EventSet::READ));
        assert_eq!(connection - EventSet::WRITE, EventSet::READ);
        assert!((EventSet::READ & EventSet::WRITE).is_empty());
    }

    #[test]
    fn poll_queue_reports_stop() {
        let queue = EventQueue::open(PoolBackend::Poll {
            poll_interval: Duration::from_millis(1),
            loop_interval: Duration::from_millis(5),
        })
        .unwrap();
        queue.stop();
        match queue.get_notifications(20) {
            Err(QueueError::Disconnected) => {}
            other => panic!("expected Disconnected, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn kernel_queue_registers_and_stops() {
        let queue = EventQueue::open(PoolBackend::Auto).unwrap();
        queue.stop();
        match queue.get_notifications(20) {
            Err(QueueError::Disconnected) => {}
            other => panic!("expected Disconnected, got {:?}", other.map(|_| ())),
        }
    }
}
