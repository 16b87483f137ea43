//! # fdmux-core
//!
//! Platform-agnostic types for the fdmux dispatcher.
//!
//! This crate defines:
//! - The `Dispatchable` capability and its `FdEvents` bitmask
//! - `DispatchReentrancy`, the per-watch concurrency policy
//! - Error types
//! - Leveled logging macros (`kerror!`, `kdebug!`, ...)
//! - Environment helpers used by configuration
//!
//! The Linux implementation lives in `fdmux-runtime`.

pub mod dispatchable;
pub mod env;
pub mod error;
pub mod kprint;

pub use dispatchable::{DispatchReentrancy, Dispatchable, FdEvents};
pub use error::{DispatchError, Result};
pub use kprint::{set_log_level, LogLevel};
