//! `SimpleDispatchThread`: a grow-only pool dispatching one target.
//!
//! ```text
//!   SimpleDispatchThread
//!   ├── wakeup (pipe write end)
//!   ├── aggregate: MultiplexingDispatchable
//!   │     ├── ReadableFd(pipe read end)  Sequential   → stop this thread
//!   │     └── target                     Reentrant
//!   └── threads: [fdmux-io-0, fdmux-io-1, ...]
//! ```
//!
//! Dropping the pool closes the write end. The terminate watch then reports
//! a hangup that never clears; each worker takes it once (the watch is
//! sequential, so one at a time), stops, and re-arms it for the next.

use crate::config::DispatcherConfig;
use crate::multiplexing::MultiplexingDispatchable;
use crate::sys;
use crate::worker::{self, RunningFlags};

use fdmux_core::error::Result;
use fdmux_core::{kdebug, DispatchReentrancy, Dispatchable};

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

pub struct SimpleDispatchThread {
    config: DispatcherConfig,
    aggregate: Arc<MultiplexingDispatchable>,
    flags: Arc<RunningFlags>,
    wakeup: Option<OwnedFd>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_index: AtomicUsize,
}

impl SimpleDispatchThread {
    /// Start one thread dispatching `target`.
    pub fn new(target: Arc<dyn Dispatchable>) -> Result<Self> {
        Self::with_config(target, DispatcherConfig::default())
    }

    pub fn with_config(target: Arc<dyn Dispatchable>, config: DispatcherConfig) -> Result<Self> {
        let (terminate, wakeup) = sys::pipe_nonblocking("Failed to create IO thread shutdown pipe")?;
        let flags = Arc::new(RunningFlags::default());

        let aggregate = Arc::new(MultiplexingDispatchable::new()?);
        let stopper = Arc::clone(&flags);
        aggregate.add_watch_fd(terminate, move || stopper.stop_current())?;
        aggregate.add_watch_with(target, DispatchReentrancy::Reentrant)?;

        let pool = Self {
            config,
            aggregate,
            flags,
            wakeup: Some(wakeup),
            threads: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
        };
        pool.add_thread()?;
        Ok(pool)
    }

    /// Add one more thread running the same loop on the same target.
    pub fn add_thread(&self) -> Result<()> {
        let mut threads = self.threads();
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        let aggregate = Arc::clone(&self.aggregate);
        let flags = Arc::clone(&self.flags);
        let handle = worker::spawn_worker(&self.config, index, move || {
            let running = flags.register_current();
            let result = worker::dispatch_loop(aggregate.as_ref(), &running);
            flags.unregister_current();
            result
        })?;

        threads.push(handle);
        kdebug!("dispatch pool now has {} threads", threads.len());
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads().len()
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SimpleDispatchThread {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut *self.threads());
        // Hang up: every worker sees the terminate watch fire.
        drop(self.wakeup.take());
        for handle in handles {
            worker::join_or_detach(handle, &self.flags);
        }
    }
}

impl std::fmt::Debug for SimpleDispatchThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleDispatchThread")
            .field("thread_name", &self.config.thread_name)
            .field("threads", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Signal, TestDispatchable};
    use fdmux_core::FdEvents;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_dispatches_single_event_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Signal::new();
        let (c, f) = (count.clone(), fired.clone());
        let target = TestDispatchable::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            f.raise();
        });
        let pool = SimpleDispatchThread::new(target.clone()).unwrap();

        target.trigger();
        assert!(fired.wait_for(TIMEOUT));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(pool);
    }

    #[test]
    fn test_sequential_watch_is_never_entered_twice() {
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let (busy, overlap, c) = (in_flight.clone(), overlapped.clone(), count.clone());
        let child = TestDispatchable::new(move || {
            if busy.swap(true, Ordering::SeqCst) {
                overlap.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(100));
            busy.store(false, Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
        });
        let inner = Arc::new(MultiplexingDispatchable::new().unwrap());
        inner
            .add_watch_with(child.clone(), DispatchReentrancy::Sequential)
            .unwrap();

        let pool = SimpleDispatchThread::new(inner).unwrap();
        pool.add_thread().unwrap();
        pool.add_thread().unwrap();

        child.trigger();
        child.trigger();
        child.trigger();
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    /// Two reentrant watches that each wait for the other to start.
    fn mutually_waiting(
        patience: Duration,
    ) -> (Arc<MultiplexingDispatchable>, [Arc<TestDispatchable>; 2], Arc<AtomicUsize>, Arc<Signal>) {
        let started = [Signal::new(), Signal::new()];
        let succeeded = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let all_done = Signal::new();

        let make = |me: usize| {
            let (mine, theirs) = (started[me].clone(), started[1 - me].clone());
            let (ok, fin, done) = (succeeded.clone(), finished.clone(), all_done.clone());
            TestDispatchable::new(move || {
                mine.raise();
                if theirs.wait_for(patience) {
                    ok.fetch_add(1, Ordering::SeqCst);
                }
                if fin.fetch_add(1, Ordering::SeqCst) == 1 {
                    done.raise();
                }
            })
        };
        let children = [make(0), make(1)];

        let inner = Arc::new(MultiplexingDispatchable::new().unwrap());
        for child in &children {
            inner
                .add_watch_with(child.clone(), DispatchReentrancy::Reentrant)
                .unwrap();
        }
        (inner, children, succeeded, all_done)
    }

    #[test]
    fn test_reentrant_watches_run_in_parallel() {
        let (inner, children, succeeded, done) = mutually_waiting(TIMEOUT);
        let pool = SimpleDispatchThread::new(inner).unwrap();
        pool.add_thread().unwrap();

        children[0].trigger();
        children[1].trigger();
        assert!(done.wait_for(TIMEOUT * 2));
        assert_eq!(succeeded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_thread_serializes_reentrant_watches() {
        let (inner, children, succeeded, done) = mutually_waiting(Duration::from_millis(300));
        let pool = SimpleDispatchThread::new(inner).unwrap();

        children[0].trigger();
        children[1].trigger();
        assert!(done.wait_for(TIMEOUT));
        // Whichever ran first gave up waiting.
        assert!(succeeded.load(Ordering::SeqCst) < 2);
        drop(pool);
    }

    #[test]
    fn test_exhausted_target_is_not_called_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exhausted = Signal::new();
        let (c, e) = (calls.clone(), exhausted.clone());
        let target = TestDispatchable::with_delegate(
            move |_| {
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
                    e.raise();
                    return false;
                }
                true
            },
            FdEvents::READABLE,
        );
        let pool = SimpleDispatchThread::new(target.clone()).unwrap();

        for _ in 0..10 {
            target.trigger();
        }
        assert!(exhausted.wait_for(TIMEOUT));
        target.trigger();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        drop(pool);
    }

    #[test]
    fn test_remote_closed_only_when_relevant() {
        let saw_hangup = Arc::new(AtomicBool::new(false));
        let seen = saw_hangup.clone();
        let deaf = TestDispatchable::with_delegate(
            move |events| {
                if events.contains(FdEvents::REMOTE_CLOSED) {
                    seen.store(true, Ordering::SeqCst);
                }
                true
            },
            FdEvents::READABLE,
        );
        let deaf_pool = SimpleDispatchThread::new(deaf.clone()).unwrap();

        let heard = Signal::new();
        let hears = heard.clone();
        let listener = TestDispatchable::with_delegate(
            move |events| {
                if events.contains(FdEvents::REMOTE_CLOSED) {
                    hears.raise();
                    return false;
                }
                true
            },
            FdEvents::READABLE | FdEvents::REMOTE_CLOSED,
        );
        let listener_pool = SimpleDispatchThread::new(listener.clone()).unwrap();

        deaf.hangup();
        listener.hangup();
        assert!(heard.wait_for(TIMEOUT));
        thread::sleep(Duration::from_millis(100));
        assert!(!saw_hangup.load(Ordering::SeqCst));
        drop(deaf_pool);
        drop(listener_pool);
    }

    #[test]
    fn test_drop_joins_every_thread() {
        let target = TestDispatchable::new(|| {});
        let pool = SimpleDispatchThread::new(target.clone()).unwrap();
        pool.add_thread().unwrap();
        pool.add_thread().unwrap();
        assert_eq!(pool.thread_count(), 3);

        drop(pool);
        // Every worker (and the aggregate they shared) is gone.
        assert_eq!(Arc::strong_count(&target), 1);
    }

    #[test]
    fn test_threads_are_named_from_config() {
        let name = Arc::new(Mutex::new(None));
        let fired = Signal::new();
        let (slot, f) = (name.clone(), fired.clone());
        let target = TestDispatchable::new(move || {
            *slot.lock().unwrap() = thread::current().name().map(str::to_string);
            f.raise();
        });
        let config = DispatcherConfig::new().thread_name("simple-test");
        let pool = SimpleDispatchThread::with_config(target.clone(), config).unwrap();

        target.trigger();
        assert!(fired.wait_for(TIMEOUT));
        assert_eq!(name.lock().unwrap().as_deref(), Some("simple-test-0"));
        drop(pool);
    }

    #[test]
    fn test_destroyed_from_own_callback() {
        let slot: Arc<Mutex<Option<SimpleDispatchThread>>> = Arc::new(Mutex::new(None));
        let destroyed = Signal::new();
        let (s, d) = (slot.clone(), destroyed.clone());
        let target = TestDispatchable::new(move || {
            let pool = s.lock().unwrap().take();
            if let Some(pool) = pool {
                drop(pool);
                d.raise();
            }
        });
        *slot.lock().unwrap() = Some(SimpleDispatchThread::new(target.clone()).unwrap());

        target.trigger();
        assert!(destroyed.wait_for(TIMEOUT));
    }
}
