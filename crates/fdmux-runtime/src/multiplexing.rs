//! # MultiplexingDispatchable: N dispatchables behind one descriptor
//!
//! Every child's `watch_fd()` is registered with a private epoll instance.
//! The epoll fd itself is the aggregate's `watch_fd()`: it polls readable
//! whenever any child has something pending. `dispatch()` pulls exactly one
//! ready registration out of epoll and hands it to its owner.
//!
//! ## Reentrancy
//!
//! ```text
//!  Sequential                      Reentrant
//!  ──────────                      ─────────
//!  EPOLLONESHOT                    level-triggered
//!  fires once, then disarmed       fires for every waiter while ready
//!  re-armed after dispatch()       no re-arm needed
//!  returns                         concurrent dispatch() allowed
//! ```
//!
//! A disarmed sequential watch is simply not reported to other threads, so
//! a busy watch is skipped for this round and picked up once re-armed. No
//! per-watch lock and no thread ever blocks waiting for a sibling.
//!
//! ## Lifetime
//!
//! Registrations live in a token-keyed table behind an `RwLock`. The hot
//! path takes the read lock just long enough to clone the watch's `Arc`;
//! `remove_watch()` may therefore run while that watch is mid-dispatch on
//! another thread. The object stays alive until the in-flight call drops
//! its clone. Tokens are never reused, so a stale epoll report can never
//! reach a newer registration.

use crate::readable_fd::ReadableFd;
use crate::sys::{self, Epoll, EPOLLONESHOT};

use fdmux_core::error::{DispatchError, Result};
use fdmux_core::{kdebug, kerror, ktrace};
use fdmux_core::{DispatchReentrancy, Dispatchable, FdEvents};

use nix::errno::Errno;

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One registered child.
struct Watch {
    token: u64,
    dispatchee: Arc<dyn Dispatchable>,
    reentrancy: DispatchReentrancy,
    relevant: FdEvents,
    /// Set once the watch leaves the table; checked right before dispatch.
    removed: AtomicBool,
}

impl Watch {
    fn interest(&self) -> u32 {
        let flags = sys::events_to_epoll(self.relevant);
        match self.reentrancy {
            DispatchReentrancy::Sequential => flags | EPOLLONESHOT,
            DispatchReentrancy::Reentrant => flags,
        }
    }
}

#[derive(Default)]
struct WatchTable {
    by_token: HashMap<u64, Arc<Watch>>,
    /// `Arc` data pointer → token. Guards double registration.
    by_identity: HashMap<usize, u64>,
}

impl WatchTable {
    fn take(&mut self, token: u64) -> Option<Arc<Watch>> {
        let watch = self.by_token.remove(&token)?;
        self.by_identity.remove(&identity_of(&watch.dispatchee));
        watch.removed.store(true, Ordering::Release);
        Some(watch)
    }
}

/// Address of the object behind an `Arc`, ignoring any vtable.
fn identity_of<D: Dispatchable + ?Sized>(dispatchee: &Arc<D>) -> usize {
    Arc::as_ptr(dispatchee) as *const () as usize
}

/// Aggregates any number of `Dispatchable`s behind a single epoll fd.
pub struct MultiplexingDispatchable {
    epoll: Epoll,
    watches: RwLock<WatchTable>,
    next_token: AtomicU64,
}

impl MultiplexingDispatchable {
    /// Create an empty aggregate.
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            watches: RwLock::new(WatchTable::default()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Create an aggregate watching each of `dispatchees` sequentially.
    pub fn with_watches<I>(dispatchees: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Dispatchable>>,
    {
        let aggregate = Self::new()?;
        for dispatchee in dispatchees {
            aggregate.add_watch(dispatchee)?;
        }
        Ok(aggregate)
    }

    /// Watch `dispatchee` with the default (`Sequential`) reentrancy.
    pub fn add_watch(&self, dispatchee: Arc<dyn Dispatchable>) -> Result<()> {
        self.add_watch_with(dispatchee, DispatchReentrancy::default())
    }

    /// Watch `dispatchee` under an explicit reentrancy policy.
    ///
    /// Fails with `AlreadyRegistered` if this exact object is already
    /// watched, or with an OS error if epoll rejects the descriptor (for
    /// example the same fd registered through a different object).
    pub fn add_watch_with(
        &self,
        dispatchee: Arc<dyn Dispatchable>,
        reentrancy: DispatchReentrancy,
    ) -> Result<()> {
        let identity = identity_of(&dispatchee);
        let mut table = self.write_table();
        if table.by_identity.contains_key(&identity) {
            return Err(DispatchError::AlreadyRegistered);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let relevant = dispatchee.relevant_events();
        let watch = Arc::new(Watch {
            token,
            dispatchee,
            reentrancy,
            relevant,
            removed: AtomicBool::new(false),
        });

        // Registered under the write lock: a report for `token` cannot be
        // looked up before the table knows about it.
        self.epoll
            .add(watch.dispatchee.watch_fd(), watch.interest(), token)
            .map_err(|e| DispatchError::os("Failed to monitor fd", e as i32))?;

        table.by_identity.insert(identity, token);
        table.by_token.insert(token, watch);
        ktrace!("watch {} added ({:?}, {:?})", token, reentrancy, relevant);
        Ok(())
    }

    /// Watch a raw descriptor; `callback` runs once per wakeup byte.
    ///
    /// `fd` must be non-blocking and deliver one-byte pulses: a pipe or a
    /// socket. If a byte cannot be read from it (an eventfd, say) the watch
    /// is exhausted and dropped rather than fired.
    ///
    /// Returns the synthetic watch so it can later be passed to
    /// `remove_watch()`.
    pub fn add_watch_fd<F>(&self, fd: OwnedFd, callback: F) -> Result<Arc<ReadableFd>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let watch = Arc::new(ReadableFd::new(fd, callback));
        self.add_watch(watch.clone())?;
        Ok(watch)
    }

    /// Stop watching `dispatchee`.
    ///
    /// Unknown or already-removed objects are a no-op. Safe to call while
    /// the same watch is being dispatched on another thread: that call
    /// finishes normally and the object is dropped when it returns.
    pub fn remove_watch<D>(&self, dispatchee: &Arc<D>) -> Result<()>
    where
        D: Dispatchable + ?Sized,
    {
        let identity = identity_of(dispatchee);
        let mut table = self.write_table();
        let Some(token) = table.by_identity.get(&identity).copied() else {
            ktrace!("remove of unwatched dispatchable ignored");
            return Ok(());
        };
        let removed = table.take(token);
        let result = match &removed {
            Some(watch) => self.unregister(watch),
            None => Ok(()),
        };
        drop(table);
        // `removed` may hold the last reference: drop it outside the lock
        // in case its destructor touches this aggregate.
        drop(removed);
        result
    }

    /// Number of live watches.
    pub fn len(&self) -> usize {
        self.read_table().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── internals ────────────────────────────────────────────────────

    fn read_table(&self) -> RwLockReadGuard<'_, WatchTable> {
        self.watches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, WatchTable> {
        self.watches.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the epoll registration. Must hold the write lock.
    fn unregister(&self, watch: &Watch) -> Result<()> {
        match self.epoll.delete(watch.dispatchee.watch_fd()) {
            Ok(()) => {
                ktrace!("watch {} removed", watch.token);
                Ok(())
            }
            Err(e) if sys::is_gone(e) => Ok(()),
            Err(e) => Err(DispatchError::os("Failed to remove fd from monitor", e as i32)),
        }
    }

    /// Re-arm a sequential watch after its dispatch returned.
    fn rearm(&self, watch: &Arc<Watch>) {
        let table = self.read_table();
        // Presence check under the lock: if the watch was removed (and the
        // fd maybe re-added under a new token) we must not touch it.
        if !table.by_token.contains_key(&watch.token) {
            return;
        }
        let result = self
            .epoll
            .modify(watch.dispatchee.watch_fd(), watch.interest(), watch.token);
        drop(table);

        match result {
            Ok(()) => {}
            Err(e) if sys::is_gone(e) => {}
            Err(e) => {
                // A watch that cannot be re-armed will never fire again.
                kerror!("failed to re-arm watch {}: {}; dropping it", watch.token, e);
                let _ = self.remove_watch(&watch.dispatchee);
            }
        }
    }

    /// Stop polling a watch whose descriptor only reports conditions the
    /// watch does not care about (typically a hangup). It stays registered.
    fn park(&self, watch: &Arc<Watch>, reported: FdEvents) {
        let table = self.read_table();
        if !table.by_token.contains_key(&watch.token) {
            return;
        }
        match self.epoll.delete(watch.dispatchee.watch_fd()) {
            Ok(()) => kdebug!(
                "watch {} parked: only {:?} reported, relevant {:?}",
                watch.token,
                reported,
                watch.relevant
            ),
            Err(e) if sys::is_gone(e) => {}
            Err(e) => kerror!("failed to park watch {}: {}", watch.token, e),
        }
    }

    /// Remove a child that returned `false`. Returns whether anything is
    /// left to dispatch.
    fn retire(&self, watch: &Arc<Watch>) -> bool {
        let mut table = self.write_table();
        let removed = table.take(watch.token);
        if let Some(watch) = &removed {
            if let Err(e) = self.unregister(watch) {
                kerror!("failed to unregister exhausted watch {}: {}", watch.token, e);
            }
            ktrace!("watch {} exhausted", watch.token);
        }
        let remaining = !table.by_token.is_empty();
        drop(table);
        drop(removed);
        remaining
    }
}

impl Dispatchable for MultiplexingDispatchable {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if events.contains(FdEvents::ERROR) {
            return false;
        }

        let (token, flags) = match self.epoll.wait_one() {
            Ok(Some(ready)) => ready,
            // Another thread took the event, or nothing was ready.
            Ok(None) | Err(Errno::EINTR) => return true,
            Err(e) => {
                kerror!("failed to read from epoll monitor: {}", e);
                return false;
            }
        };

        let watch = match self.read_table().by_token.get(&token) {
            Some(watch) => Arc::clone(watch),
            // Removed after epoll reported it.
            None => return true,
        };

        let reported = sys::epoll_to_events(flags);
        let wanted = reported & (watch.relevant | FdEvents::ERROR);
        if wanted.is_empty() {
            self.park(&watch, reported);
            return true;
        }

        if watch.removed.load(Ordering::Acquire) {
            return true;
        }

        if watch.dispatchee.dispatch(wanted) {
            if watch.reentrancy == DispatchReentrancy::Sequential {
                self.rearm(&watch);
            }
            true
        } else {
            self.retire(&watch)
        }
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE
    }
}

impl fmt::Debug for MultiplexingDispatchable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexingDispatchable")
            .field("epoll", &self.epoll)
            .field("watches", &self.len())
            .finish()
    }
}
