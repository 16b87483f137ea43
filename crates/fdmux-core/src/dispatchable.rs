//! The `Dispatchable` capability
//!
//! Everything the dispatcher drives is a `Dispatchable`: something that owns
//! a pollable descriptor and can process one ready event at a time. The
//! dispatcher never looks at what the descriptor represents (socket, pipe,
//! timer, another epoll instance).

use std::os::fd::BorrowedFd;

bitflags::bitflags! {
    /// Readiness conditions a descriptor can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FdEvents: u32 {
        /// Data can be read without blocking
        const READABLE = 1 << 0;
        /// Data can be written without blocking
        const WRITABLE = 1 << 1;
        /// The remote end hung up
        const REMOTE_CLOSED = 1 << 2;
        /// An error condition is pending on the descriptor
        const ERROR = 1 << 3;
    }
}

/// Whether a watch may be dispatched by more than one thread at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchReentrancy {
    /// At most one in-flight `dispatch()` for this watch, system-wide.
    #[default]
    Sequential,
    /// Any number of pool threads may dispatch this watch concurrently.
    Reentrant,
}

/// A watchable descriptor plus one-shot event processing.
///
/// **Contract:**
/// - `watch_fd()` stays valid for the lifetime of the object and becomes
///   ready exactly when one of `relevant_events()` is pending.
/// - `dispatch()` processes *at most one* pending event. The events passed
///   in may be a superset of `relevant_events()`; extra bits are ignored.
/// - `dispatch()` returns `false` only when the object will never produce
///   another event. Callers stop dispatching it after that.
/// - `dispatch()` takes `&self` because reentrant watches are dispatched
///   from several threads at once. Mutable state lives behind atomics or
///   locks inside the implementation.
pub trait Dispatchable: Send + Sync {
    /// Descriptor to hand to a readiness-polling primitive.
    fn watch_fd(&self) -> BorrowedFd<'_>;

    /// Process at most one event. `false` means permanently exhausted.
    fn dispatch(&self, events: FdEvents) -> bool;

    /// The conditions this object ever cares about.
    fn relevant_events(&self) -> FdEvents;
}
