//! # fdmux-runtime
//!
//! Linux implementation of the fdmux dispatcher.
//!
//! This crate provides:
//! - `MultiplexingDispatchable`: many dispatchables behind one epoll fd
//! - `SimpleDispatchThread`: a grow-only pool of dispatch threads
//! - `ThreadedDispatcher`: a pool that can also remove single threads
//! - `ReadableFd`: a raw wakeup descriptor with a callback
//! - `DispatcherConfig`: thread naming, stack size and shutdown bound

pub mod config;
pub mod multiplexing;
pub mod readable_fd;
pub mod simple_thread;
pub mod threaded;

mod signal;
mod sys;
mod worker;

#[cfg(test)]
mod test_support;

// Re-exports
pub use config::DispatcherConfig;
pub use multiplexing::MultiplexingDispatchable;
pub use readable_fd::ReadableFd;
pub use simple_thread::SimpleDispatchThread;
pub use threaded::ThreadedDispatcher;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // epoll, pipe2 and pthread_sigmask are all we need.
    } else {
        compile_error!("fdmux-runtime requires Linux (epoll)");
    }
}
