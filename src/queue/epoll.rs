//! The epoll backend.
//!
//! Registration is edge-triggered. The stop canary is an `eventfd` carried
//! under a reserved key; writing to it unblocks `epoll_wait` and surfaces
//! [`QueueError::Disconnected`].

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use crate::sys::linux::{eventfd, unistd, EfdFlags};
use crate::sys::{errno::Errno, io_err, unistd::close};

use super::{EventSet, Notification, NotificationErrors, QueueError};

/// Key reserved for the stop canary.
const CANARY_KEY: u64 = u64::MAX;

pub(crate) struct EpollQueue {
    epoll_fd: RawFd,
    canary_fd: RawFd,
    /// Mirror of the kernel interest set, keyed by descriptor.
    interest: Mutex<HashMap<RawFd, EventSet>>,
}

impl EpollQueue {
    pub fn open() -> io::Result<EpollQueue> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io_err)?;
        let canary_fd = match eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = close(epoll_fd);
                return Err(io_err(err));
            }
        };

        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, CANARY_KEY);
        if let Err(err) = epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, canary_fd, Some(&mut event)) {
            let _ = close(epoll_fd);
            let _ = close(canary_fd);
            return Err(io_err(err));
        }

        Ok(EpollQueue {
            epoll_fd,
            canary_fd,
            interest: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let current = interest.get(&fd).copied().unwrap_or(EventSet::empty());
        let combined = current | events;
        let op = if current.is_empty() {
            EpollOp::EpollCtlAdd
        } else {
            EpollOp::EpollCtlMod
        };
        let mut event = EpollEvent::new(epoll_flags(combined), fd as u64);
        epoll_ctl(self.epoll_fd, op, fd, Some(&mut event)).map_err(io_err)?;
        interest.insert(fd, combined);
        Ok(())
    }

    pub fn remove_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let current = match interest.get(&fd).copied() {
            Some(current) => current,
            None => return Ok(()),
        };
        let remaining = current - events;
        let result = if remaining.is_empty() {
            interest.remove(&fd);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None)
        } else {
            interest.insert(fd, remaining);
            let mut event = EpollEvent::new(epoll_flags(remaining), fd as u64);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, Some(&mut event))
        };
        match result {
            Ok(()) => Ok(()),
            // The descriptor may have been closed already, which deregisters
            // it from the kernel's side.
            Err(err) if matches!(err.as_errno(), Some(Errno::ENOENT) | Some(Errno::EBADF)) => Ok(()),
            Err(err) => Err(io_err(err)),
        }
    }

    pub fn get_notifications(&self, max: usize) -> Result<Vec<Notification>, QueueError> {
        let mut events = vec![EpollEvent::empty(); max.max(1)];
        let count = loop {
            match epoll_wait(self.epoll_fd, &mut events, -1) {
                Ok(count) => break count,
                Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
                Err(err) => return Err(QueueError::Io(io_err(err))),
            }
        };

        let mut notifications = Vec::with_capacity(count);
        for event in &events[..count] {
            if event.data() == CANARY_KEY {
                // Drain the eventfd so a reopened queue starts clean.
                let _ = unistd::read(self.canary_fd, &mut [0u8; 8]);
                return Err(QueueError::Disconnected);
            }
            let fd = event.data() as RawFd;
            notifications.push(self.notification(fd, event.events()));
        }
        Ok(notifications)
    }

    fn notification(&self, fd: RawFd, flags: EpollFlags) -> Notification {
        let mut events = EventSet::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            events |= EventSet::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            events |= EventSet::WRITE;
        }

        let mut errors = NotificationErrors::empty();
        let hangup = flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLRDHUP);
        if hangup && !events.contains(EventSet::READ) {
            errors |= NotificationErrors::END_OF_FILE;
        }
        if flags.contains(EpollFlags::EPOLLERR) || flags.contains(EpollFlags::EPOLLPRI) {
            errors |= NotificationErrors::ERROR;
        }

        // Some edge-triggered paths report a bare hangup with no event bits;
        // substitute the registered set so waiters are still woken.
        if events.is_empty() {
            if let Some(registered) = self.interest.lock().unwrap().get(&fd) {
                events = *registered;
            }
        }

        Notification { fd, events, errors }
    }

    pub fn stop(&self) {
        let _ = unistd::write(self.canary_fd, &1u64.to_ne_bytes());
    }
}

impl Drop for EpollQueue {
    fn drop(&mut self) {
        let _ = close(self.canary_fd);
        let _ = close(self.epoll_fd);
    }
}

fn epoll_flags(events: EventSet) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP;
    if events.contains(EventSet::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if events.contains(EventSet::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}
