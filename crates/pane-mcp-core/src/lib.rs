//! # pane-mcp-core
//!
//! Core types for the pane-mcp server.
//!
//! This crate contains the fundamental types with **no internal dependencies**
//! on other pane-mcp crates. It provides:
//!
//! - Session handles and connection-pool context keys
//! - Execution requests, strategies, captured output and responses
//! - Key types for input handling
//! - Configuration
//! - Error types
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other pane-mcp crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod key;
pub mod request;
pub mod session;

// Re-export commonly used types
pub use config::{
    ExecutionSettings, HostBackend, HostSettings, PoolSettings, ServerConfig, ServerSettings,
};
pub use error::{Error, ErrorKind, Result};
pub use key::Key;
pub use request::{
    CapturedOutput, ExecutionRequest, ExecutionStrategy, MemorySnapshot, Response, ResponseError,
};
pub use session::{ContextKey, SessionHandle};
