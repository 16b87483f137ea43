//! Dispatch worker threads
//!
//! Each worker blocks in `poll()` on its pool's top-level descriptor and
//! calls `dispatch()` once per wakeup. A worker runs until the flag for its
//! own thread is cleared, which only ever happens from inside a dispatch
//! running on that thread (a shutdown or terminate watch firing).
//!
//! ```text
//!   loop while running[me]:
//!       poll(top.watch_fd(), POLLIN)
//!       top.dispatch(READABLE) ── false ──► Err(Exhausted)
//! ```
//!
//! Failure policy: an OS error or a panic that escapes a worker aborts the
//! process. There is no caller left to hand it to.

use crate::config::DispatcherConfig;
use crate::signal::spawn_with_signals_blocked;
use crate::sys;

use fdmux_core::error::{DispatchError, Result};
use fdmux_core::{kdebug, kerror};
use fdmux_core::{Dispatchable, FdEvents};

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

/// Per-thread "keep running" flags for one pool.
#[derive(Default)]
pub(crate) struct RunningFlags {
    flags: Mutex<HashMap<ThreadId, Arc<AtomicBool>>>,
}

impl RunningFlags {
    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<AtomicBool>>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the calling thread; the returned flag starts out set.
    pub(crate) fn register_current(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.lock().insert(thread::current().id(), Arc::clone(&flag));
        flag
    }

    pub(crate) fn unregister_current(&self) {
        self.lock().remove(&thread::current().id());
    }

    /// Ask the calling thread's loop to exit after the current dispatch.
    /// A no-op on threads that do not belong to this pool.
    pub(crate) fn stop_current(&self) {
        if let Some(flag) = self.lock().get(&thread::current().id()) {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Wait-then-dispatch until `running` is cleared.
pub(crate) fn dispatch_loop(top: &dyn Dispatchable, running: &AtomicBool) -> Result<()> {
    while running.load(Ordering::Acquire) {
        sys::wait_readable(top.watch_fd())?;
        if !top.dispatch(FdEvents::READABLE) {
            return Err(DispatchError::Exhausted);
        }
    }
    Ok(())
}

/// Spawn worker `index` of a pool.
///
/// The body runs with every signal blocked, under the name
/// `<config.thread_name>-<index>`. Any error it returns, or any panic that
/// escapes it, terminates the process.
pub(crate) fn spawn_worker<F>(
    config: &DispatcherConfig,
    index: usize,
    body: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let mut builder = thread::Builder::new().name(config.worker_name(index));
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }

    spawn_with_signals_blocked(builder, move || {
        kdebug!("dispatch thread started");
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => kdebug!("dispatch thread exiting"),
            Ok(Err(e)) => fatal(&e),
            Err(payload) => {
                let what = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                kerror!("panic escaped dispatch: {}", what);
                std::process::abort();
            }
        }
    })
}

/// Log and abort. Used where a failure cannot be reported to a caller.
pub(crate) fn fatal(err: &dyn std::fmt::Display) -> ! {
    kerror!("fatal error on dispatch thread: {}", err);
    std::process::abort()
}

/// Join `handle`, unless it is the calling thread.
///
/// A pool torn down from one of its own callbacks cannot join the thread
/// it is running on: that thread is told to stop and left detached, and
/// exits once the current dispatch unwinds back into its loop.
pub(crate) fn join_or_detach(handle: JoinHandle<()>, flags: &RunningFlags) {
    if handle.thread().id() == thread::current().id() {
        flags.stop_current();
        kdebug!("dispatch thread torn down from its own callback; detaching");
        drop(handle);
        return;
    }
    // Workers abort rather than panic, so an Err here is unreachable in
    // practice; nothing useful to do with it during teardown anyway.
    let _ = handle.join();
}
