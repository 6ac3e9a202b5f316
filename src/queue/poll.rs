//! The userland poll backend.
//!
//! A fallback for platforms without epoll/kqueue: each call snapshots the
//! interest map into a `pollfd` array and blocks in `poll(2)` for at most
//! `poll_interval`. After `loop_interval` without readiness it returns an
//! empty batch so the driver task can yield cooperatively. Stopping is a
//! flag checked on every iteration.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sys::errno::Errno;
use crate::sys::io_err;
use crate::sys::poll::{poll, PollFd, PollFlags};

use super::{EventSet, Notification, NotificationErrors, QueueError};

pub(crate) struct PollQueue {
    interest: Mutex<HashMap<RawFd, EventSet>>,
    stopped: AtomicBool,
    poll_interval: Duration,
    loop_interval: Duration,
}

impl PollQueue {
    pub fn new(poll_interval: Duration, loop_interval: Duration) -> PollQueue {
        PollQueue {
            interest: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            poll_interval,
            loop_interval,
        }
    }

    pub fn add_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let entry = interest.entry(fd).or_insert(EventSet::empty());
        *entry |= events;
        Ok(())
    }

    pub fn remove_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        if let Some(entry) = interest.get_mut(&fd) {
            *entry -= events;
            if entry.is_empty() {
                interest.remove(&fd);
            }
        }
        Ok(())
    }

    pub fn get_notifications(&self, max: usize) -> Result<Vec<Notification>, QueueError> {
        let deadline = Instant::now() + self.loop_interval;
        let timeout = self.poll_interval.as_millis().max(1) as i32;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(QueueError::Disconnected);
            }

            let snapshot: Vec<(RawFd, EventSet)> = {
                let interest = self.interest.lock().unwrap();
                interest.iter().map(|(fd, set)| (*fd, *set)).collect()
            };

            if snapshot.is_empty() {
                std::thread::sleep(self.poll_interval);
            } else {
                let mut fds: Vec<PollFd> = snapshot
                    .iter()
                    .map(|(fd, set)| PollFd::new(*fd, poll_flags(*set)))
                    .collect();
                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
                    Err(err) => return Err(QueueError::Io(io_err(err))),
                }

                if self.stopped.load(Ordering::SeqCst) {
                    return Err(QueueError::Disconnected);
                }

                let mut notifications = Vec::new();
                for (poll_fd, (fd, registered)) in fds.iter().zip(&snapshot) {
                    let revents = match poll_fd.revents() {
                        Some(revents) if !revents.is_empty() => revents,
                        _ => continue,
                    };
                    notifications.push(notification(*fd, *registered, revents));
                    if notifications.len() == max {
                        break;
                    }
                }
                if !notifications.is_empty() {
                    return Ok(notifications);
                }
            }

            if Instant::now() >= deadline {
                // Hand control back so the driver can yield.
                return Ok(Vec::new());
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn poll_flags(events: EventSet) -> PollFlags {
    let mut flags = PollFlags::empty();
    if events.contains(EventSet::READ) {
        flags |= PollFlags::POLLIN;
    }
    if events.contains(EventSet::WRITE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn notification(fd: RawFd, registered: EventSet, revents: PollFlags) -> Notification {
    let mut events = EventSet::empty();
    if revents.contains(PollFlags::POLLIN) {
        events |= EventSet::READ;
    }
    if revents.contains(PollFlags::POLLOUT) {
        events |= EventSet::WRITE;
    }

    let mut errors = NotificationErrors::empty();
    if revents.contains(PollFlags::POLLHUP) && !events.contains(EventSet::READ) {
        errors |= NotificationErrors::END_OF_FILE;
    }
    if revents.contains(PollFlags::POLLERR) || revents.contains(PollFlags::POLLNVAL) {
        errors |= NotificationErrors::ERROR;
    }

    // A bare hangup carries no event bits; substitute the registered set so
    // waiters are still woken.
    if events.is_empty() {
        events = registered;
    }

    Notification { fd, events, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_map_tracks_unions() {
        let queue = PollQueue::new(Duration::from_millis(1), Duration::from_millis(2));
        queue.add_events(7, EventSet::READ).unwrap();
        queue.add_events(7, EventSet::WRITE).unwrap();
        assert_eq!(
            queue.interest.lock().unwrap().get(&7),
            Some(&EventSet::CONNECTION)
        );

        queue.remove_events(7, EventSet::READ).unwrap();
        assert_eq!(queue.interest.lock().unwrap().get(&7), Some(&EventSet::WRITE));

        queue.remove_events(7, EventSet::WRITE).unwrap();
        assert!(queue.interest.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_batch_after_loop_interval() {
        let queue = PollQueue::new(Duration::from_millis(1), Duration::from_millis(2));
        let batch = queue.get_notifications(20).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn hangup_substitutes_registered_set() {
        let n = notification(3, EventSet::CONNECTION, PollFlags::POLLHUP);
        assert_eq!(n.events, EventSet::CONNECTION);
        assert!(n.errors.contains(NotificationErrors::END_OF_FILE));
    }
}
