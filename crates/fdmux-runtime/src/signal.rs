//! Signal masking for dispatch threads
//!
//! IO threads must never receive asynchronous process signals; those belong
//! to whichever thread the embedding process designates. New threads inherit
//! the spawning thread's mask, so we block everything around `spawn()` and
//! restore afterwards. That way a masking failure surfaces as an error from
//! the constructor instead of killing a half-started thread.

use fdmux_core::error::{DispatchError, Result};
use fdmux_core::kerror;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

use std::thread::{Builder, JoinHandle};

/// Spawn `f` on a thread that starts with every signal blocked.
pub(crate) fn spawn_with_signals_blocked<F, T>(builder: Builder, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut previous = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous))
        .map_err(|e| DispatchError::os("Failed to block signals on IO thread", e as i32))?;

    let spawned = builder.spawn(f);

    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
        // The worker is already running with the right mask; only the
        // caller's own mask is off now.
        kerror!("failed to restore signal mask after spawning IO thread: {}", e);
    }

    spawned.map_err(DispatchError::Spawn)
}
