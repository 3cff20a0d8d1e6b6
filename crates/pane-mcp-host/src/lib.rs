//! # pane-mcp-host
//!
//! The terminal host boundary for pane-mcp.
//!
//! This crate provides:
//! - [`TerminalHost`] / [`HostConnection`], the only way the rest of the
//!   workspace touches a terminal
//! - [`TmuxHost`], driving a tmux server through its command-line client
//! - [`MemoryHost`], a scripted in-process shell for tests and dry runs
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on pane-mcp-core
//! and performs all terminal I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod host;
pub mod memory;
pub mod tmux;

// Re-export commonly used types
pub use host::{HostConnection, TerminalHost};
pub use memory::{MemoryConnection, MemoryHost};
pub use tmux::{TmuxConnection, TmuxHost};
