//! Pane MCP Server Implementation
//!
//! This module implements the MCP server using rmcp 0.9's #[tool_router] pattern.
//! It routes MCP tool calls to the command executor.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData as McpError,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use pane_mcp_core::{Error, ErrorKind, ExecutionRequest};
use pane_mcp_exec::CommandExecutor;

use crate::tools::*;

/// Map an engine error onto a JSON-RPC error.
fn to_mcp_error(context: &str, err: Error) -> McpError {
    match err.kind() {
        ErrorKind::InvalidInput => {
            warn!("{}: {}", context, err);
            McpError::new(ErrorCode(-32602), format!("{context}: {err}"), None)
        }
        _ => {
            error!("{}: {}", context, err);
            McpError::new(ErrorCode(-32603), format!("{context}: {err}"), None)
        }
    }
}

/// Pretty JSON text content, or `fallback` if serialization fails.
fn json_content<T: Serialize>(value: &T, fallback: impl FnOnce() -> String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_else(|_| fallback()),
    )])
}

/// Pane MCP Server
///
/// Runs commands in terminal multiplexer panes and exposes them via MCP tools.
#[derive(Clone)]
pub struct PaneMcpServer {
    /// Command executor (owns the connection pool)
    executor: Arc<CommandExecutor>,
    /// Tool router for handling MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl PaneMcpServer {
    /// Create a server backed by `executor`
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            tool_router: Self::tool_router(),
        }
    }

    /// The executor behind this server
    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    /// Run a command and capture its output
    #[tool(
        description = "Run a shell command in a terminal pane and return only that command's output. \
                       Multi-line commands and heredocs are supported. Set isolate_output (alias \
                       wait_for_output) to false to type the command and return immediately."
    )]
    #[instrument(skip_all)]
    pub async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let settings = self.executor.settings();
        let request = ExecutionRequest {
            command: params.command,
            timeout_seconds: params
                .timeout_seconds
                .unwrap_or(settings.default_timeout_seconds),
            isolate_output: params.isolate_output,
            working_directory: params.working_directory,
            max_output_chars: params
                .max_output_chars
                .unwrap_or(settings.max_output_chars),
            session_id: params.session_id,
        };

        info!(
            "Executing command: session_id={:?}, isolate_output={}, timeout={}s, {} chars",
            request.session_id,
            request.isolate_output,
            request.timeout_seconds,
            request.command.chars().count()
        );

        let response = self.executor.execute_command(request).await;

        if response.success {
            debug!(
                "Command finished: output={} chars, truncated={}, timed_out={}",
                response.original_length, response.truncated, response.timed_out
            );
        }

        Ok(CallToolResult::success(vec![Content::text(
            response.to_json(settings.compact_threshold_chars),
        )]))
    }

    /// Close idle pooled connections
    #[tool(description = "Close every idle pooled terminal connection and report how many were closed")]
    #[instrument(skip_all)]
    pub async fn cleanup_connections(
        &self,
        Parameters(_params): Parameters<CleanupConnectionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let evicted = self.executor.cleanup_connections().await;
        info!("Cleanup closed {} connection(s)", evicted);

        let response = CleanupConnectionsResponse {
            evicted,
            message: format!("Closed {evicted} idle connection(s)"),
        };
        Ok(json_content(&response, || format!("{evicted} connections closed")))
    }

    /// Report pool and lock occupancy
    #[tool(description = "Report pooled connections, session locks and estimated memory held by the server")]
    #[instrument(skip_all)]
    pub async fn get_memory_stats(
        &self,
        Parameters(_params): Parameters<MemoryStatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let stats = self.executor.memory_stats();
        debug!("Memory stats: {:?}", stats);
        Ok(json_content(&stats, || {
            format!("{} pooled connections", stats.pooled_connection_count)
        }))
    }

    /// Send raw text to a pane
    #[tool(description = "Send raw text to a terminal pane without waiting. Include \\n to submit a line.")]
    #[instrument(skip_all)]
    pub async fn send_text(
        &self,
        Parameters(params): Parameters<SendTextParams>,
    ) -> Result<CallToolResult, McpError> {
        let chars_sent = params.text.chars().count();
        debug!(
            "Sending text: session_id={:?}, length={} chars",
            params.session_id, chars_sent
        );

        let handle = self
            .executor
            .send_text(params.session_id.as_deref(), &params.text)
            .await
            .map_err(|e| to_mcp_error("Failed to send text", e))?;

        let response = SendTextResponse {
            session_id: handle.session_id.clone(),
            chars_sent,
            message: "Text sent successfully".to_string(),
        };
        Ok(json_content(&response, || format!("Sent {chars_sent} chars")))
    }

    /// Read a pane's screen
    #[tool(description = "Read the text currently shown in a terminal pane, optionally with scrollback")]
    #[instrument(skip_all)]
    pub async fn read_terminal_output(
        &self,
        Parameters(params): Parameters<ReadOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        debug!(
            "Reading output: session_id={:?}, scrollback={}, max_lines={:?}",
            params.session_id, params.include_scrollback, params.max_lines
        );

        let read = self
            .executor
            .read_output(
                params.session_id.as_deref(),
                params.include_scrollback,
                params.max_lines,
                params.max_output_chars,
            )
            .await
            .map_err(|e| to_mcp_error("Failed to read output", e))?;

        let response = ReadOutputResponse {
            session_id: read.session_id,
            output: read.text,
            total_lines: read.total_lines,
            truncated: read.truncated,
        };
        Ok(json_content(&response, || response.output.clone()))
    }

    /// Clear a pane's screen
    #[tool(description = "Clear the visible screen of a terminal pane (Ctrl+L); scrollback is kept")]
    #[instrument(skip_all)]
    pub async fn clear_screen(
        &self,
        Parameters(params): Parameters<ClearScreenParams>,
    ) -> Result<CallToolResult, McpError> {
        let handle = self
            .executor
            .clear_screen(params.session_id.as_deref())
            .await
            .map_err(|e| to_mcp_error("Failed to clear screen", e))?;

        let response = SessionActionResponse {
            session_id: handle.session_id.clone(),
            message: "Screen cleared".to_string(),
        };
        Ok(json_content(&response, || "Screen cleared".to_string()))
    }

    /// Press a named key
    #[tool(description = "Press a key in a terminal pane, e.g. Enter, Tab, Up, Ctrl+c, Alt+b")]
    #[instrument(skip_all)]
    pub async fn press_key(
        &self,
        Parameters(params): Parameters<PressKeyParams>,
    ) -> Result<CallToolResult, McpError> {
        debug!(
            "Pressing key: session_id={:?}, key={}",
            params.session_id, params.key
        );

        let handle = self
            .executor
            .press_key(params.session_id.as_deref(), &params.key)
            .await
            .map_err(|e| to_mcp_error("Failed to press key", e))?;

        let response = SessionActionResponse {
            session_id: handle.session_id.clone(),
            message: format!("Pressed {}", params.key),
        };
        Ok(json_content(&response, || format!("Pressed {}", params.key)))
    }

    /// Describe a pane
    #[tool(description = "Resolve a terminal pane (or the active one) and report its window, tab and pane ids")]
    #[instrument(skip_all)]
    pub async fn get_session_info(
        &self,
        Parameters(params): Parameters<SessionInfoParams>,
    ) -> Result<CallToolResult, McpError> {
        let info = self
            .executor
            .session_info(params.session_id.as_deref())
            .await
            .map_err(|e| to_mcp_error("Failed to resolve session", e))?;

        let response = SessionInfoResponse {
            session: SessionSummary::from(&info.handle),
            backend: info.backend.to_string(),
            connection_id: info.connection_id.to_string(),
            connected_at: info.connected_at.to_rfc3339(),
        };
        Ok(json_content(&response, || info.handle.session_id.clone()))
    }

    /// List every pane
    #[tool(description = "List all terminal panes known to the host")]
    #[instrument(skip_all)]
    pub async fn list_sessions(
        &self,
        Parameters(_params): Parameters<ListSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions = self
            .executor
            .list_sessions()
            .await
            .map_err(|e| to_mcp_error("Failed to list sessions", e))?;

        let count = sessions.len();
        info!("Found {} pane(s)", count);

        let response = ListSessionsResponse {
            sessions: sessions.iter().map(SessionSummary::from).collect(),
            count,
        };
        Ok(json_content(&response, || format!("{count} sessions")))
    }

    /// Open a new tab
    #[tool(description = "Open a new tab (tmux window) and make its pane active")]
    #[instrument(skip_all)]
    pub async fn create_tab(
        &self,
        Parameters(params): Parameters<CreateTabParams>,
    ) -> Result<CallToolResult, McpError> {
        let handle = self
            .executor
            .create_tab(params.session_id.as_deref())
            .await
            .map_err(|e| to_mcp_error("Failed to create tab", e))?;

        let response = SessionCreatedResponse {
            session: SessionSummary::from(&handle),
            message: format!("Created tab {}", handle.tab_id),
        };
        Ok(json_content(&response, || handle.session_id.clone()))
    }

    /// Split a pane
    #[tool(description = "Split a terminal pane into a new session and make it active")]
    #[instrument(skip_all)]
    pub async fn create_session(
        &self,
        Parameters(params): Parameters<CreateSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let handle = self
            .executor
            .create_session(params.session_id.as_deref())
            .await
            .map_err(|e| to_mcp_error("Failed to create session", e))?;

        let response = SessionCreatedResponse {
            session: SessionSummary::from(&handle),
            message: format!("Created session {}", handle.session_id),
        };
        Ok(json_content(&response, || handle.session_id.clone()))
    }
}

// Implement the ServerHandler trait to define server capabilities
#[tool_handler]
impl rmcp::ServerHandler for PaneMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Pane MCP Server - Run commands inside live terminal multiplexer panes. \
                 Use execute_command to run a command and get only its output, \
                 read_terminal_output to see the screen, send_text and press_key for \
                 interactive programs, and list_sessions / create_tab / create_session \
                 to manage panes."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_maps_to_invalid_params() {
        let err = to_mcp_error("ctx", Error::InvalidInput("bad".into()));
        assert_eq!(err.code, ErrorCode(-32602));
        assert!(err.message.contains("ctx: "));

        let err = to_mcp_error("ctx", Error::Connection("down".into()));
        assert_eq!(err.code, ErrorCode(-32603));
    }
}
