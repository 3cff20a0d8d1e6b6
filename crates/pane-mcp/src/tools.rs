//! MCP Tool Types
//!
//! This module defines all MCP tool parameter and response types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use pane_mcp_core::SessionHandle;

fn default_true() -> bool {
    true
}

// =============================================================================
// Command Execution Tools
// =============================================================================

/// Parameters for execute_command
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    /// Shell command to run (may span several lines)
    pub command: String,

    /// Seconds to wait for the command to finish (server default when omitted)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Capture only this command's output and wait for it to finish.
    /// When false the command is typed and the call returns immediately.
    #[serde(default = "default_true", alias = "wait_for_output")]
    pub isolate_output: bool,

    /// Directory to run the command in
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Upper bound on returned output, in characters (server default when omitted)
    #[serde(default)]
    pub max_output_chars: Option<usize>,

    /// Target pane id (e.g. "%3"); the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Parameters for cleanup_connections
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CleanupConnectionsParams {}

/// Response for cleanup_connections
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CleanupConnectionsResponse {
    /// Connections closed
    pub evicted: usize,

    /// Summary message
    pub message: String,
}

/// Parameters for get_memory_stats
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MemoryStatsParams {}

// =============================================================================
// Input Tools
// =============================================================================

/// Parameters for send_text
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SendTextParams {
    /// Raw text to send; include "\n" to submit a line
    pub text: String,

    /// Target pane id; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response for send_text
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SendTextResponse {
    /// Pane the text went to
    pub session_id: String,

    /// Characters sent
    pub chars_sent: usize,

    /// Summary message
    pub message: String,
}

/// Parameters for press_key
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PressKeyParams {
    /// Key name: "Enter", "Tab", "Escape", "Backspace", "Up", "Down",
    /// "Left", "Right", "Home", "End", "Ctrl+<letter>", "Alt+<char>",
    /// or a single character
    pub key: String,

    /// Target pane id; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Parameters for clear_screen
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClearScreenParams {
    /// Target pane id; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response for input tools without a payload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionActionResponse {
    /// Pane acted on
    pub session_id: String,

    /// Summary message
    pub message: String,
}

// =============================================================================
// Output Tools
// =============================================================================

/// Parameters for read_terminal_output
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadOutputParams {
    /// Target pane id; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,

    /// Include scrollback above the visible screen
    #[serde(default)]
    pub include_scrollback: bool,

    /// Keep only the last N lines
    #[serde(default)]
    pub max_lines: Option<usize>,

    /// Upper bound on returned text, in characters (server default when omitted)
    #[serde(default)]
    pub max_output_chars: Option<usize>,
}

/// Response for read_terminal_output
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadOutputResponse {
    /// Pane that was read
    pub session_id: String,

    /// Screen text
    pub output: String,

    /// Lines on screen before bounding
    pub total_lines: usize,

    /// Whether a bound cut the text
    pub truncated: bool,
}

// =============================================================================
// Session Tools
// =============================================================================

/// Identifiers of one pane
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    /// Pane id, usable as `session_id` in other tools
    pub session_id: String,

    /// Top-level window (tmux session) id
    pub window_id: String,

    /// Tab (tmux window) id
    pub tab_id: String,
}

impl From<&SessionHandle> for SessionSummary {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            session_id: handle.session_id.clone(),
            window_id: handle.window_id.clone(),
            tab_id: handle.tab_id.clone(),
        }
    }
}

/// Parameters for get_session_info
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfoParams {
    /// Pane id to resolve; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response for get_session_info
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfoResponse {
    /// Resolved pane
    #[serde(flatten)]
    pub session: SessionSummary,

    /// Host backend ("tmux" or "memory")
    pub backend: String,

    /// Pooled connection serving the pane
    pub connection_id: String,

    /// When that connection was opened (RFC 3339)
    pub connected_at: String,
}

/// Parameters for list_sessions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListSessionsParams {}

/// Response for list_sessions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListSessionsResponse {
    /// Every pane the host knows about
    pub sessions: Vec<SessionSummary>,

    /// Total count
    pub count: usize,
}

/// Parameters for create_tab
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateTabParams {
    /// Open the tab next to this pane; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Parameters for create_session
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateSessionParams {
    /// Pane to split; the active pane when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response for create_tab and create_session
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionCreatedResponse {
    /// The new pane
    #[serde(flatten)]
    pub session: SessionSummary,

    /// Summary message
    pub message: String,
}
