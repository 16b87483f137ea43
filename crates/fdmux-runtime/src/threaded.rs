//! # ThreadedDispatcher: a dispatch pool that can also shrink
//!
//! Same shape as `SimpleDispatchThread`, but the terminate watch is a
//! `ThreadShutdownRequestHandler` that reports which thread it stopped:
//!
//! ```text
//!   remove_thread()                       worker N
//!   ───────────────                       ────────
//!   write 1 byte ───────────────────────► shutdown watch fires (Sequential,
//!                                         so exactly one worker gets it)
//!                                         running[N] = false
//!                                         loop exits
//!   wait (bounded) ◄──── push id N ────── report_exit()
//!   join N, drop it from the pool
//!
//!   timed out, nobody took it:
//!   read the byte back, ShutdownTimeout
//! ```
//!
//! Dropping the dispatcher closes the write end instead; the resulting
//! hangup is picked up by every worker in turn.

use crate::config::DispatcherConfig;
use crate::multiplexing::MultiplexingDispatchable;
use crate::sys::{self, Pulse};
use crate::worker::{self, RunningFlags};

use fdmux_core::error::{DispatchError, Result};
use fdmux_core::{kdebug, kinfo};
use fdmux_core::{DispatchReentrancy, Dispatchable, FdEvents};

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops whichever pool thread dispatches it, and lets `remove_thread()`
/// find out which one that was.
struct ThreadShutdownRequestHandler {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
    flags: RunningFlags,
    exited: Mutex<VecDeque<ThreadId>>,
    exited_cv: Condvar,
    /// `remove_thread()` calls in flight. Queued exits belong to them.
    removing: AtomicUsize,
}

/// Marks one `remove_thread()` in flight for as long as it lives.
struct Removal<'a>(&'a ThreadShutdownRequestHandler);

impl Drop for Removal<'_> {
    fn drop(&mut self) {
        self.0.removing.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ThreadShutdownRequestHandler {
    fn new() -> Result<Self> {
        let (read, write) = sys::pipe_nonblocking("Failed to create shutdown pipe for IO thread")?;
        Ok(Self {
            read,
            write: Mutex::new(Some(write)),
            flags: RunningFlags::default(),
            exited: Mutex::new(VecDeque::new()),
            exited_cv: Condvar::new(),
            removing: AtomicUsize::new(0),
        })
    }

    /// Ask exactly one worker to stop.
    fn terminate_one_thread(&self) -> Result<()> {
        let write = lock(&self.write);
        match write.as_ref() {
            Some(fd) => sys::write_pulse(fd.as_fd())
                .map_err(|e| DispatchError::os("Failed to trigger thread shutdown", e as i32)),
            // Already tearing down: everyone is stopping anyway.
            None => Ok(()),
        }
    }

    /// Take back a request nobody acted on. `false` if a worker already
    /// consumed it and is on its way out.
    fn withdraw_one(&self) -> Result<bool> {
        match sys::read_pulse(self.read.as_fd()) {
            Ok(Pulse::Consumed) | Ok(Pulse::Closed) => Ok(true),
            Ok(Pulse::Empty) => Ok(false),
            Err(e) => Err(DispatchError::os("Failed to withdraw thread shutdown", e as i32)),
        }
    }

    /// Registered under the exit-queue lock, so `take_orphans()` never
    /// steals an exit a remover is about to wait for.
    fn begin_removal(&self) -> Removal<'_> {
        let _exited = lock(&self.exited);
        self.removing.fetch_add(1, Ordering::SeqCst);
        Removal(self)
    }

    /// Exits no `remove_thread()` is waiting for.
    fn take_orphans(&self) -> Vec<ThreadId> {
        let mut exited = lock(&self.exited);
        if self.removing.load(Ordering::SeqCst) > 0 {
            return Vec::new();
        }
        exited.drain(..).collect()
    }

    /// Hang up the pipe so every worker stops.
    fn terminate_all_threads(&self) {
        lock(&self.write).take();
    }

    /// Called by a worker on its way out.
    fn report_exit(&self) {
        lock(&self.exited).push_back(thread::current().id());
        self.exited_cv.notify_all();
    }

    /// Wait for the next exited thread, up to `deadline`.
    fn next_exited(&self, deadline: Instant) -> Option<ThreadId> {
        let mut exited = lock(&self.exited);
        loop {
            if let Some(id) = exited.pop_front() {
                return Some(id);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, timeout) = self
                .exited_cv
                .wait_timeout(exited, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            exited = guard;
            if timeout.timed_out() && exited.is_empty() {
                return None;
            }
        }
    }
}

impl Dispatchable for ThreadShutdownRequestHandler {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        match sys::read_pulse(self.read.as_fd()) {
            Ok(Pulse::Consumed) | Ok(Pulse::Closed) => {}
            // Someone else drained it; not a request for us.
            Ok(Pulse::Empty) if !events.contains(FdEvents::REMOTE_CLOSED) => return true,
            Ok(Pulse::Empty) => {}
            Err(e) => worker::fatal(&DispatchError::os(
                "Failed to clear shutdown notification",
                e as i32,
            )),
        }
        self.flags.stop_current();
        // Stay registered: after a hangup the other workers still need to
        // see it.
        true
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE | FdEvents::REMOTE_CLOSED
    }
}

/// A pool of threads dispatching one target, growable and shrinkable.
pub struct ThreadedDispatcher {
    config: DispatcherConfig,
    aggregate: Arc<MultiplexingDispatchable>,
    shutdown: Arc<ThreadShutdownRequestHandler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_index: AtomicUsize,
}

impl ThreadedDispatcher {
    /// Start one thread, named `<name>-0`, dispatching `target`.
    pub fn new(name: impl Into<String>, target: Arc<dyn Dispatchable>) -> Result<Self> {
        Self::with_config(target, DispatcherConfig::default().thread_name(name))
    }

    pub fn with_config(target: Arc<dyn Dispatchable>, config: DispatcherConfig) -> Result<Self> {
        let shutdown = Arc::new(ThreadShutdownRequestHandler::new()?);
        let aggregate = Arc::new(MultiplexingDispatchable::new()?);
        // One thread per shutdown pulse.
        aggregate.add_watch_with(shutdown.clone(), DispatchReentrancy::Sequential)?;
        aggregate.add_watch_with(target, DispatchReentrancy::Reentrant)?;

        let dispatcher = Self {
            config,
            aggregate,
            shutdown,
            threads: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
        };
        dispatcher.add_thread()?;
        Ok(dispatcher)
    }

    /// Add one more dispatch thread.
    pub fn add_thread(&self) -> Result<()> {
        self.reap_exited();
        let mut threads = lock(&self.threads);
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        let aggregate = Arc::clone(&self.aggregate);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = worker::spawn_worker(&self.config, index, move || {
            let running = shutdown.flags.register_current();
            let result = worker::dispatch_loop(aggregate.as_ref(), &running);
            shutdown.flags.unregister_current();
            shutdown.report_exit();
            result
        })?;

        threads.push(handle);
        kdebug!("dispatcher now has {} threads", threads.len());
        Ok(())
    }

    /// Stop and join one thread; which one is up to the pool.
    ///
    /// Waits at most `config.shutdown_timeout` for some thread to take the
    /// request. If every thread is stuck inside a slow `dispatch()` the
    /// request is withdrawn and `ShutdownTimeout` returned; the pool is
    /// left exactly as it was.
    pub fn remove_thread(&self) -> Result<()> {
        if lock(&self.threads).is_empty() {
            return Err(DispatchError::NoWorkers);
        }

        let _removal = self.shutdown.begin_removal();
        self.shutdown.terminate_one_thread()?;

        let timeout = self.config.shutdown_timeout;
        let mut deadline = Instant::now() + timeout;
        let mut withdraw_attempted = false;
        loop {
            let id = match self.shutdown.next_exited(deadline) {
                Some(id) => id,
                None if !withdraw_attempted => {
                    withdraw_attempted = true;
                    if self.shutdown.withdraw_one()? {
                        return Err(DispatchError::ShutdownTimeout(timeout));
                    }
                    // Taken just now: that worker is already leaving.
                    deadline = Instant::now() + timeout;
                    continue;
                }
                None => return Err(DispatchError::ShutdownTimeout(timeout)),
            };

            let handle = {
                let mut threads = lock(&self.threads);
                threads
                    .iter()
                    .position(|t| t.thread().id() == id)
                    .map(|at| threads.remove(at))
            };
            // Not ours any more (a detached thread); keep waiting.
            if let Some(handle) = handle {
                let _ = handle.join();
                kinfo!("dispatch thread removed, {} left", self.thread_count());
                return Ok(());
            }
        }
    }

    pub fn thread_count(&self) -> usize {
        self.reap_exited();
        lock(&self.threads).len()
    }

    /// Join workers that exited without a `remove_thread()` waiting on them.
    fn reap_exited(&self) {
        let orphans = self.shutdown.take_orphans();
        if orphans.is_empty() {
            return;
        }
        let exited: Vec<JoinHandle<()>> = {
            let mut threads = lock(&self.threads);
            let (exited, live) = std::mem::take(&mut *threads)
                .into_iter()
                .partition(|t| orphans.contains(&t.thread().id()));
            *threads = live;
            exited
        };
        for handle in exited {
            let _ = handle.join();
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut *lock(&self.threads));
        self.shutdown.terminate_all_threads();

        let me = thread::current().id();
        if handles.iter().any(|t| t.thread().id() == me) {
            // Torn down from our own callback: this thread can't wait for
            // itself. Deliver its shutdown now; it exits on return.
            self.shutdown.dispatch(FdEvents::REMOTE_CLOSED);
        }
        for handle in handles {
            worker::join_or_detach(handle, &self.shutdown.flags);
        }
    }
}

impl std::fmt::Debug for ThreadedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedDispatcher")
            .field("thread_name", &self.config.thread_name)
            .field("threads", &self.thread_count())
            .finish()
    }
}
