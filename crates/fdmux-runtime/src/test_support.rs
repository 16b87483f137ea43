//! Shared fixtures for the runtime's unit tests.

use crate::sys::{self, Pulse};

use fdmux_core::{Dispatchable, FdEvents};

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One-shot flag a test thread can block on.
#[derive(Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn raise(&self) {
        *self.raised.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub(crate) fn raised(&self) -> bool {
        *self.raised.lock().unwrap()
    }

    /// `true` if raised within `timeout`.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let guard = self.raised.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap();
        *guard
    }
}

enum Behaviour {
    /// Clear one pulse, then run the closure.
    OnPulse(Box<dyn Fn() + Send + Sync>),
    /// Clear a pulse if readable, then hand the events to the delegate and
    /// return its verdict.
    Delegate(Box<dyn Fn(FdEvents) -> bool + Send + Sync>),
}

/// A pipe-backed dispatchable. `trigger()` makes it readable once,
/// `hangup()` closes the write end.
pub(crate) struct TestDispatchable {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
    behaviour: Behaviour,
    relevant: FdEvents,
}

impl TestDispatchable {
    pub(crate) fn new<F>(on_pulse: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Behaviour::OnPulse(Box::new(on_pulse)), FdEvents::READABLE)
    }

    pub(crate) fn with_delegate<F>(delegate: F, relevant: FdEvents) -> Arc<Self>
    where
        F: Fn(FdEvents) -> bool + Send + Sync + 'static,
    {
        Self::build(Behaviour::Delegate(Box::new(delegate)), relevant)
    }

    fn build(behaviour: Behaviour, relevant: FdEvents) -> Arc<Self> {
        let (read, write) = sys::pipe_nonblocking("test pipe").unwrap();
        Arc::new(Self {
            read,
            write: Mutex::new(Some(write)),
            behaviour,
            relevant,
        })
    }

    pub(crate) fn trigger(&self) {
        let write = self.write.lock().unwrap();
        let fd = write.as_ref().expect("trigger after hangup");
        sys::write_pulse(fd.as_fd()).unwrap();
    }

    pub(crate) fn hangup(&self) {
        self.write.lock().unwrap().take();
    }
}

impl Dispatchable for TestDispatchable {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        match &self.behaviour {
            Behaviour::Delegate(delegate) => {
                if events.contains(FdEvents::READABLE) {
                    let _ = sys::read_pulse(self.read.as_fd());
                }
                delegate(events)
            }
            Behaviour::OnPulse(on_pulse) => {
                if !events.contains(FdEvents::READABLE) {
                    return true;
                }
                match sys::read_pulse(self.read.as_fd()) {
                    Ok(Pulse::Consumed) => {
                        on_pulse();
                        true
                    }
                    // A concurrent reentrant dispatch got the byte first.
                    Ok(Pulse::Empty) => true,
                    Ok(Pulse::Closed) => false,
                    Err(e) => panic!("test pipe read failed: {}", e),
                }
            }
        }
    }

    fn relevant_events(&self) -> FdEvents {
        self.relevant
    }
}
