//! Dispatcher configuration
//!
//! Compiled-in defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use fdmux_runtime::DispatcherConfig;
//!
//! let config = DispatcherConfig::from_env()
//!     .thread_name("rpc-io")
//!     .shutdown_timeout(Duration::from_secs(5));
//! ```

use fdmux_core::env::{env_get, env_get_opt};
use std::time::Duration;

/// Library defaults
pub mod defaults {
    /// Base name for pool threads; workers are named `<base>-<n>`
    pub const THREAD_NAME: &str = "fdmux-io";

    /// How long `remove_thread()` waits for a worker to acknowledge.
    /// Generous, because a worker may be deep inside a slow `dispatch()`.
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
}

/// Thread-pool configuration shared by `SimpleDispatchThread` and
/// `ThreadedDispatcher`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Base thread name
    pub thread_name: String,
    /// Bound on the single-thread removal rendezvous
    pub shutdown_timeout: Duration,
    /// Worker stack size (None = system default)
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DispatcherConfig {
    /// Defaults with environment overrides (all optional):
    /// - `FDMUX_THREAD_NAME` - Base thread name
    /// - `FDMUX_SHUTDOWN_TIMEOUT_MS` - `remove_thread()` bound in milliseconds
    /// - `FDMUX_STACK_SIZE` - Worker stack size in bytes
    pub fn from_env() -> Self {
        Self {
            thread_name: env_get("FDMUX_THREAD_NAME", defaults::THREAD_NAME.to_string()),
            shutdown_timeout: Duration::from_millis(env_get(
                "FDMUX_SHUTDOWN_TIMEOUT_MS",
                defaults::SHUTDOWN_TIMEOUT_MS,
            )),
            stack_size: env_get_opt("FDMUX_STACK_SIZE"),
        }
    }

    /// Compiled defaults only, no environment lookup.
    pub fn new() -> Self {
        Self {
            thread_name: defaults::THREAD_NAME.to_string(),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            stack_size: None,
        }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub(crate) fn worker_name(&self, index: usize) -> String {
        format!("{}-{}", self.thread_name, index)
    }
}
