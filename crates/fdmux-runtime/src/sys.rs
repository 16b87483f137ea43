//! Thin OS wrappers: epoll, self-pipes and blocking readiness waits.
//!
//! Everything here speaks raw `libc`; errno handling goes through
//! `nix::errno::Errno` so callers can match on specific codes.

use fdmux_core::error::{DispatchError, Result};
use fdmux_core::FdEvents;

use nix::errno::Errno;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

// ── Event translation ────────────────────────────────────────────────

/// Interest mask for `epoll_ctl`. Hangup and error are always reported by
/// the kernel, so they never need to be requested.
pub(crate) fn events_to_epoll(events: FdEvents) -> u32 {
    let mut flags = 0u32;
    if events.contains(FdEvents::READABLE) {
        flags |= libc::EPOLLIN as u32;
    }
    if events.contains(FdEvents::WRITABLE) {
        flags |= libc::EPOLLOUT as u32;
    }
    if events.contains(FdEvents::REMOTE_CLOSED) {
        flags |= libc::EPOLLRDHUP as u32;
    }
    flags
}

pub(crate) fn epoll_to_events(flags: u32) -> FdEvents {
    let mut events = FdEvents::empty();
    if flags & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
        events |= FdEvents::READABLE;
    }
    if flags & libc::EPOLLOUT as u32 != 0 {
        events |= FdEvents::WRITABLE;
    }
    if flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        events |= FdEvents::REMOTE_CLOSED;
    }
    if flags & libc::EPOLLERR as u32 != 0 {
        events |= FdEvents::ERROR;
    }
    events
}

pub(crate) const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

// ── Epoll ────────────────────────────────────────────────────────────

/// Owned epoll instance. Registrations carry a caller-chosen `u64` token.
#[derive(Debug)]
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        let raw = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
            .map_err(|e| DispatchError::os("Failed to create epoll monitor", e as i32))?;
        // Safety: epoll_create1 just handed us a fresh descriptor.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token,
        };
        Errno::result(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) })
            .map(drop)
    }

    pub(crate) fn add(&self, fd: BorrowedFd<'_>, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, fd.as_raw_fd(), interest, token)
    }

    pub(crate) fn modify(&self, fd: BorrowedFd<'_>, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, fd.as_raw_fd(), interest, token)
    }

    pub(crate) fn delete(&self, fd: BorrowedFd<'_>) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_DEL, fd.as_raw_fd(), 0, 0)
    }

    /// Non-blocking: fetch at most one ready registration.
    pub(crate) fn wait_one(&self) -> std::result::Result<Option<(u64, u32)>, Errno> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let n = Errno::result(unsafe { libc::epoll_wait(self.fd.as_raw_fd(), &mut event, 1, 0) })?;
        if n == 0 {
            return Ok(None);
        }
        let (token, flags) = (event.u64, event.events);
        Ok(Some((token, flags)))
    }
}

impl AsFd for Epoll {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// `ENOENT`/`EBADF` from `epoll_ctl` mean the registration is already gone.
#[inline]
pub(crate) fn is_gone(errno: Errno) -> bool {
    matches!(errno, Errno::ENOENT | Errno::EBADF)
}

// ── Self-pipe ────────────────────────────────────────────────────────

/// Result of clearing one wakeup pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pulse {
    /// One byte consumed
    Consumed,
    /// Write end closed and nothing left to read
    Closed,
    /// Nothing pending (someone else got there first)
    Empty,
}

/// `(read_end, write_end)` of a fresh non-blocking, close-on-exec pipe.
pub(crate) fn pipe_nonblocking(context: &'static str) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as libc::c_int; 2];
    Errno::result(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
        .map_err(|e| DispatchError::os(context, e as i32))?;
    // Safety: pipe2 succeeded, both descriptors are ours.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Write one wakeup byte.
pub(crate) fn write_pulse(fd: BorrowedFd<'_>) -> std::result::Result<(), Errno> {
    let byte = 0u8;
    loop {
        let ret = unsafe {
            libc::write(fd.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1)
        };
        match Errno::result(ret) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err(Errno::EIO),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read exactly one wakeup byte, if there is one.
pub(crate) fn read_pulse(fd: BorrowedFd<'_>) -> std::result::Result<Pulse, Errno> {
    let mut byte = 0u8;
    loop {
        let ret = unsafe {
            libc::read(fd.as_raw_fd(), &mut byte as *mut u8 as *mut libc::c_void, 1)
        };
        match Errno::result(ret) {
            Ok(0) => return Ok(Pulse::Closed),
            Ok(_) => return Ok(Pulse::Consumed),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(Pulse::Empty),
            Err(e) => return Err(e),
        }
    }
}

// ── Blocking wait ────────────────────────────────────────────────────

/// Block until `fd` polls readable (or hung up / errored).
pub(crate) fn wait_readable(fd: BorrowedFd<'_>) -> Result<()> {
    let mut waiter = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        match Errno::result(unsafe { libc::poll(&mut waiter, 1, -1) }) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(DispatchError::os("Failed to wait for event", e as i32)),
        }
    }
}

/// Zero-timeout readability check.
#[cfg(test)]
pub(crate) fn poll_readable_now(fd: BorrowedFd<'_>) -> Result<bool> {
    let mut waiter = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let n = Errno::result(unsafe { libc::poll(&mut waiter, 1, 0) })
        .map_err(|e| DispatchError::os("Failed to poll fd", e as i32))?;
    Ok(n > 0 && waiter.revents & libc::POLLIN != 0)
}
