//! `ReadableFd`: a raw wakeup descriptor plus a callback, as a `Dispatchable`.
//!
//! Used for self-pipes and other one-shot notification fds. Each dispatch
//! clears exactly one byte before invoking the callback, so N pulses written
//! to a pipe produce N callbacks. The descriptor must be non-blocking and
//! carry one-byte pulses (a pipe or a socket). A descriptor that cannot be
//! read a byte at a time exhausts the watch instead of firing it.

use crate::sys::{self, Pulse};

use fdmux_core::{kerror, Dispatchable, FdEvents};

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

pub struct ReadableFd {
    fd: OwnedFd,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl ReadableFd {
    pub fn new<F>(fd: OwnedFd, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            fd,
            callback: Box::new(callback),
        }
    }
}

impl Dispatchable for ReadableFd {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if events.intersects(FdEvents::READABLE | FdEvents::REMOTE_CLOSED) {
            match sys::read_pulse(self.fd.as_fd()) {
                Ok(Pulse::Consumed) | Ok(Pulse::Closed) | Ok(Pulse::Empty) => {}
                Err(e) => {
                    kerror!("failed to clear notification fd: {}", e);
                    return false;
                }
            }
            (self.callback)();
        }
        true
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE | FdEvents::REMOTE_CLOSED
    }
}

impl fmt::Debug for ReadableFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableFd").field("fd", &self.fd).finish()
    }
}
