//! # fdmux
//!
//! Readiness-driven dispatch for file-descriptor based IO.
//!
//! Anything that owns a descriptor and can process "one unit of work" when
//! it becomes ready implements [`Dispatchable`]. Any number of them can be
//! folded into one descriptor with [`MultiplexingDispatchable`], and driven
//! by a pool of blocking OS threads with [`SimpleDispatchThread`] or
//! [`ThreadedDispatcher`].
//!
//! ```rust,ignore
//! use fdmux::{MultiplexingDispatchable, ThreadedDispatcher, DispatchReentrancy};
//! use std::sync::Arc;
//!
//! let connections = Arc::new(MultiplexingDispatchable::new()?);
//! connections.add_watch_with(client, DispatchReentrancy::Sequential)?;
//!
//! let io = ThreadedDispatcher::new("rpc-io", connections.clone())?;
//! io.add_thread()?;      // more concurrent dispatch capacity
//! io.remove_thread()?;   // and back again
//! ```
//!
//! ## Crates
//!
//! - `fdmux-core`: the `Dispatchable` trait, `FdEvents`, errors and logging
//! - `fdmux-runtime`: the Linux epoll multiplexer and the thread pools

pub use fdmux_core::{
    kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn,
    set_log_level, DispatchError, DispatchReentrancy, Dispatchable, FdEvents, LogLevel, Result,
};

pub use fdmux_runtime::{
    DispatcherConfig, MultiplexingDispatchable, ReadableFd, SimpleDispatchThread,
    ThreadedDispatcher,
};

/// Library defaults
pub mod defaults {
    pub use fdmux_runtime::config::defaults::*;
}
