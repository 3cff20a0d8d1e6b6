//! # pane-mcp-exec
//!
//! Command execution engine for pane-mcp.
//!
//! This crate provides:
//! - [`ConnectionPool`], one host connection per context with idle expiry
//! - [`classify`], picking a delivery strategy for command text
//! - [`Deliveries`], the four ways text is placed into a session
//! - [`run_isolated`], the sentinel protocol that captures one command's output
//! - [`shape`], bounding captured output into a [`Response`](pane_mcp_core::Response)
//! - [`CommandExecutor`], tying the pieces together per request
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on pane-mcp-core and
//! pane-mcp-host and owns all pool and lock state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod executor;
pub mod isolation;
pub mod pool;
pub mod shaper;
pub mod strategy;

// Re-export commonly used types
pub use classify::{classify, classify_with, StrategyExt};
pub use executor::{CommandExecutor, ScreenRead, SessionInfo};
pub use isolation::{
    extract, run_isolated, Extraction, IsolatedRun, IsolationMarker, IsolationState, PollSettings,
};
pub use pool::{ConnectionLease, ConnectionPool, PoolStats, PooledConnection};
pub use shaper::{shape, truncate_chars};
pub use strategy::{
    shell_quote, BracketedPasteDelivery, Deliveries, Delivery, DirectDelivery,
    ScriptFileDelivery, TextInjectionDelivery,
};
