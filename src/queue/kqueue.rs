//! The kqueue backend.
//!
//! Read and write interest are separate `EV_CLEAR` filters. The stop canary
//! is an `EVFILT_USER` event triggered with `NOTE_TRIGGER`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
use crate::sys::{errno::Errno, io_err, unistd::close};

use super::{EventSet, Notification, NotificationErrors, QueueError};

/// Ident reserved for the stop canary.
const CANARY_IDENT: usize = usize::MAX;

pub(crate) struct KqueueQueue {
    kqueue_fd: RawFd,
    /// Mirror of the kernel interest set, keyed by descriptor.
    interest: Mutex<HashMap<RawFd, EventSet>>,
}

impl KqueueQueue {
    pub fn open() -> io::Result<KqueueQueue> {
        let kqueue_fd = kqueue().map_err(io_err)?;

        let canary = KEvent::new(
            CANARY_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            0,
        );
        if let Err(err) = kevent_ts(kqueue_fd, &[canary], &mut [], None) {
            let _ = close(kqueue_fd);
            return Err(io_err(err));
        }

        Ok(KqueueQueue {
            kqueue_fd,
            interest: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let current = interest.get(&fd).copied().unwrap_or(EventSet::empty());
        let mut changes = Vec::with_capacity(2);
        for (event, filter) in filters(events) {
            if !current.contains(event) {
                changes.push(KEvent::new(
                    fd as usize,
                    filter,
                    EventFlag::EV_ADD | EventFlag::EV_CLEAR,
                    FilterFlag::empty(),
                    0,
                    0,
                ));
            }
        }
        if !changes.is_empty() {
            kevent_ts(self.kqueue_fd, &changes, &mut [], None).map_err(io_err)?;
        }
        interest.insert(fd, current | events);
        Ok(())
    }

    pub fn remove_events(&self, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        let current = match interest.get(&fd).copied() {
            Some(current) => current,
            None => return Ok(()),
        };
        for (event, filter) in filters(events) {
            if !current.contains(event) {
                continue;
            }
            let change = KEvent::new(
                fd as usize,
                filter,
                EventFlag::EV_DELETE,
                FilterFlag::empty(),
                0,
                0,
            );
            match kevent_ts(self.kqueue_fd, &[change], &mut [], None) {
                Ok(_) => {}
                // Closing a descriptor removes its filters on the kernel side.
                Err(err)
                    if matches!(err.as_errno(), Some(Errno::ENOENT) | Some(Errno::EBADF)) => {}
                Err(err) => return Err(io_err(err)),
            }
        }
        let remaining = current - events;
        if remaining.is_empty() {
            interest.remove(&fd);
        } else {
            interest.insert(fd, remaining);
        }
        Ok(())
    }

    pub fn get_notifications(&self, max: usize) -> Result<Vec<Notification>, QueueError> {
        let empty = KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        let mut events = vec![empty; max.max(1)];
        let count = loop {
            match kevent_ts(self.kqueue_fd, &[], &mut events, None) {
                Ok(count) => break count,
                Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
                Err(err) => return Err(QueueError::Io(io_err(err))),
            }
        };

        // kqueue reports each filter separately; merge per descriptor so all
        // waiters for one fd resume in a single critical section.
        let mut notifications: Vec<Notification> = Vec::with_capacity(count);
        for event in &events[..count] {
            if event.filter() == EventFilter::EVFILT_USER && event.ident() == CANARY_IDENT {
                return Err(QueueError::Disconnected);
            }
            let fd = event.ident() as RawFd;
            let (mut set, mut errors) = (EventSet::empty(), NotificationErrors::empty());
            match event.filter() {
                EventFilter::EVFILT_READ => set |= EventSet::READ,
                EventFilter::EVFILT_WRITE => set |= EventSet::WRITE,
                _ => {}
            }
            if event.flags().contains(EventFlag::EV_EOF) && !set.contains(EventSet::READ) {
                errors |= NotificationErrors::END_OF_FILE;
            }
            if event.flags().contains(EventFlag::EV_ERROR) {
                errors |= NotificationErrors::ERROR;
            }
            if set.is_empty() && errors.is_empty() {
                if let Some(registered) = self.interest.lock().unwrap().get(&fd) {
                    set = *registered;
                }
            }

            if let Some(existing) = notifications.iter_mut().find(|n| n.fd == fd) {
                existing.events |= set;
                existing.errors |= errors;
            } else {
                notifications.push(Notification {
                    fd,
                    events: set,
                    errors,
                });
            }
        }
        Ok(notifications)
    }

    pub fn stop(&self) {
        let trigger = KEvent::new(
            CANARY_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            0,
            0,
        );
        let _ = kevent_ts(self.kqueue_fd, &[trigger], &mut [], None);
    }
}

impl Drop for KqueueQueue {
    fn drop(&mut self) {
        let _ = close(self.kqueue_fd);
    }
}

fn filters(events: EventSet) -> impl Iterator<Item = (EventSet, EventFilter)> {
    let mut pairs = Vec::with_capacity(2);
    if events.contains(EventSet::READ) {
        pairs.push((EventSet::READ, EventFilter::EVFILT_READ));
    }
    if events.contains(EventSet::WRITE) {
        pairs.push((EventSet::WRITE, EventFilter::EVFILT_WRITE));
    }
    pairs.into_iter()
}
