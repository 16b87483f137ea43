//! Error types for the dispatcher

use core::fmt;
use std::time::Duration;

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while building or driving a dispatcher
#[derive(Debug)]
pub enum DispatchError {
    /// A system call failed. `context` names what we were doing.
    Os { context: &'static str, errno: i32 },

    /// The OS refused to spawn a worker thread
    Spawn(std::io::Error),

    /// The same `Dispatchable` object is already watched
    AlreadyRegistered,

    /// No worker acknowledged a termination pulse in time
    ShutdownTimeout(Duration),

    /// `remove_thread()` on a pool with no threads left
    NoWorkers,

    /// A pool's top-level dispatchable reported permanent exhaustion
    Exhausted,
}

impl DispatchError {
    /// Build an `Os` error from a raw errno value.
    pub fn os(context: &'static str, errno: i32) -> Self {
        DispatchError::Os { context, errno }
    }

    /// The raw errno, if this is an OS-level failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            DispatchError::Os { errno, .. } => Some(*errno),
            DispatchError::Spawn(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Os { context, errno } => write!(
                f,
                "{}: {}",
                context,
                std::io::Error::from_raw_os_error(*errno)
            ),
            DispatchError::Spawn(e) => write!(f, "failed to spawn dispatch thread: {}", e),
            DispatchError::AlreadyRegistered => write!(f, "dispatchable is already watched"),
            DispatchError::ShutdownTimeout(t) => {
                write!(f, "no dispatch thread shut down within {:?}", t)
            }
            DispatchError::NoWorkers => write!(f, "dispatcher has no threads to remove"),
            DispatchError::Exhausted => write!(f, "top-level dispatchable is exhausted"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}
