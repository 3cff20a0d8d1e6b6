//! The I/O boundary between pane-mcp and the terminal application.
//!
//! Everything above this module talks to panes only through these two
//! traits, so the execution engine can be driven by tmux in production and
//! by [`MemoryHost`](crate::MemoryHost) in tests.

use std::sync::Arc;

use async_trait::async_trait;
use pane_mcp_core::{Result, SessionHandle};
use uuid::Uuid;

/// A terminal application that can hand out connections.
#[async_trait]
pub trait TerminalHost: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Establish a connection. Fails with `Error::Connection` when the host
    /// is not reachable.
    async fn connect(&self) -> Result<Arc<dyn HostConnection>>;
}

/// A live connection to a terminal host.
///
/// All text-level operations are fire-and-forget: they return once the host
/// accepted the input, not when a command finished.
#[async_trait]
pub trait HostConnection: Send + Sync + std::fmt::Debug {
    /// Identifier of this connection, stable for its lifetime.
    fn id(&self) -> Uuid;

    /// The pane the host currently considers active.
    async fn current_session(&self) -> Result<SessionHandle>;

    /// Look up a pane by id. `Error::SessionNotFound` if it is gone.
    async fn resolve_session(&self, session_id: &str) -> Result<SessionHandle>;

    /// Every pane known to the host.
    async fn list_sessions(&self) -> Result<Vec<SessionHandle>>;

    /// Write raw text to the pane input, byte for byte, as if typed.
    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()>;

    /// Insert text through the host's out-of-band input buffer.
    ///
    /// The text arrives as one unit; nothing is executed until a newline or
    /// Enter is sent separately.
    async fn inject_text(&self, session: &SessionHandle, text: &str) -> Result<()>;

    /// Current pane contents, optionally preceded by the scrollback history.
    async fn get_screen_contents(
        &self,
        session: &SessionHandle,
        include_scrollback: bool,
    ) -> Result<String>;

    /// Open a new tab next to `session`, or in the active window.
    async fn create_tab(&self, session: Option<&SessionHandle>) -> Result<SessionHandle>;

    /// Split `session` into a new pane.
    async fn create_session(&self, session: &SessionHandle) -> Result<SessionHandle>;

    /// Cheap liveness check of the connection itself.
    async fn probe(&self) -> Result<()>;

    /// Release the connection. Later calls fail with `Error::Connection`.
    async fn close(&self);
}

/// Parse a tab-separated `session_id`/`window_id`/`pane_id` line as printed
/// with [`PANE_FORMAT`](crate::tmux::PANE_FORMAT).
pub(crate) fn parse_pane_line(line: &str) -> Option<SessionHandle> {
    let mut fields = line.trim_end_matches(['\r', '\n']).split('\t');
    let window_id = fields.next().filter(|s| s.starts_with('$'))?;
    let tab_id = fields.next().filter(|s| s.starts_with('@'))?;
    let session_id = fields.next().filter(|s| s.starts_with('%'))?;
    if fields.next().is_some() {
        return None;
    }
    Some(SessionHandle::new(session_id, window_id, tab_id))
}

/// Drop the empty rows a terminal pads the bottom of the screen with.
pub(crate) fn trim_trailing_blank_lines(screen: &str) -> String {
    let lines: Vec<&str> = screen.lines().collect();
    let keep = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map_or(0, |last| last + 1);
    lines[..keep].join("\n")
}
