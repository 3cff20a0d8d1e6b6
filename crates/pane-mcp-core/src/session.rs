//! Session types: which terminal pane an operation runs against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one terminal pane on the host.
///
/// For tmux the ids map as `session_id` = pane (`%3`), `tab_id` = window
/// (`@1`) and `window_id` = tmux session (`$0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Pane identifier, the target for text and screen reads
    pub session_id: String,
    /// Top-level window containing the pane
    pub window_id: String,
    /// Tab containing the pane
    pub tab_id: String,
    /// Last time an operation used this pane through the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Cleared when the pane closed or a health check failed
    pub is_healthy: bool,
}

impl SessionHandle {
    /// Create a healthy handle that has not been used yet.
    pub fn new(
        session_id: impl Into<String>,
        window_id: impl Into<String>,
        tab_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            window_id: window_id.into(),
            tab_id: tab_id.into(),
            last_used_at: None,
            is_healthy: true,
        }
    }

    /// Record a use at the current wall-clock time.
    pub fn touch(&mut self) {
        self.last_used_at = Some(Utc::now());
    }

    /// Flag the pane as gone or failing its health check.
    pub fn mark_unhealthy(&mut self) {
        self.is_healthy = false;
    }

    /// Approximate heap footprint, used for memory diagnostics.
    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.session_id.capacity()
            + self.window_id.capacity()
            + self.tab_id.capacity()
    }
}

/// Key under which the connection pool tracks a logical client context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Whatever pane the host considers current
    Active,
    /// A specific pane by id
    Session(String),
}

impl ContextKey {
    /// Build a key from an optional session id supplied by a caller.
    pub fn from_session(session_id: Option<&str>) -> Self {
        match session_id.map(str::trim) {
            Some(id) if !id.is_empty() => ContextKey::Session(id.to_string()),
            _ => ContextKey::Active,
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextKey::Active => write!(f, "active"),
            ContextKey::Session(id) => write!(f, "session:{id}"),
        }
    }
}
