//! Per-platform re-exports of the kernel interfaces used by the event queue
//! backends.

#[cfg(target_os = "linux")]
pub mod linux {
    pub use nix::sys::eventfd::{eventfd, EfdFlags};

    pub mod unistd {
        pub use nix::unistd::{read, write};
    }

    pub use nix::Error;
}

#[cfg(unix)]
pub mod poll {
    pub use nix::poll::{poll, PollFd, PollFlags};
}

#[cfg(unix)]
pub mod socket {
    pub use nix::sys::socket::{shutdown, Shutdown};
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub mod event {
    pub use nix::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
}

#[cfg(unix)]
pub mod unistd {
    pub use nix::unistd::close;
}

#[cfg(unix)]
pub mod errno {
    pub use nix::errno::Errno;
}

#[cfg(unix)]
pub use nix::libc;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll {
    pub use nix::sys::epoll::{
        epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    };
}

/// Converts a `nix` error into `std::io::Error`.
#[cfg(unix)]
pub fn io_err(err: nix::Error) -> std::io::Error {
    match err.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}
