//! Session management core for a graph-based media server.
//!
//! Session items wrap server nodes and devices, negotiate their formats,
//! and link them together.  Everything runs on one thread: asynchronous
//! server operations are futures polled by the core's [`MainLoop`], and
//! multi-step lifecycles are driven by [`Transition`]s.

pub mod config;
pub mod core;
pub mod error;
pub mod format;
pub mod graph;
pub mod items;
pub mod link;
pub mod main_loop;
pub mod properties;
pub mod server;
pub mod session_item;
pub mod transition;

#[cfg(test)]
mod test_support;

pub use crate::config::Settings;
pub use crate::core::{Core, WeakCore};
pub use crate::error::{Error, ErrorCategory, Result};
pub use crate::main_loop::MainLoop;
pub use crate::properties::Properties;
pub use crate::session_item::{ItemFlags, ItemId, SessionItem};
pub use crate::transition::{Cancellable, Step, StepRunner, Transition};
