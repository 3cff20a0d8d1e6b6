//! Request, result and diagnostic types exchanged with the execution engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind, Result};

/// How command text is delivered into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Literal text plus a newline, as if typed
    Direct,
    /// Written to a temporary executable script that is run by reference
    ScriptFile,
    /// Inserted through the host's out-of-band input buffer
    TextInjection,
    /// Wrapped in bracketed-paste markers so it arrives as one paste
    BracketedPaste,
}

impl ExecutionStrategy {
    /// All strategies, in order of increasing delivery cost.
    pub const ALL: [ExecutionStrategy; 4] = [
        ExecutionStrategy::Direct,
        ExecutionStrategy::TextInjection,
        ExecutionStrategy::BracketedPaste,
        ExecutionStrategy::ScriptFile,
    ];

    /// Whether the text reaches the session as one indivisible unit.
    pub fn is_atomic(&self) -> bool {
        !matches!(self, ExecutionStrategy::Direct)
    }

    /// Stable snake_case name, as used in configuration and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStrategy::Direct => "direct",
            ExecutionStrategy::ScriptFile => "script_file",
            ExecutionStrategy::TextInjection => "text_injection",
            ExecutionStrategy::BracketedPaste => "bracketed_paste",
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ExecutionStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| Error::InvalidInput(format!("Unknown execution strategy: {s}")))
    }
}

/// A single command execution request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Shell text to run
    pub command: String,
    /// How long to wait for the command to finish
    pub timeout_seconds: u64,
    /// Wrap the command in sentinels and capture its output
    pub isolate_output: bool,
    /// Directory to run the command in
    pub working_directory: Option<String>,
    /// Upper bound on returned output, in characters
    pub max_output_chars: usize,
    /// Target pane; the host's active pane when absent
    pub session_id: Option<String>,
}

impl ExecutionRequest {
    /// Check the request before anything is sent to a session.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidInput("command cannot be empty".to_string()));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidInput(
                "timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.max_output_chars == 0 {
            return Err(Error::InvalidInput(
                "max_output_chars must be > 0".to_string(),
            ));
        }
        if let Some(dir) = &self.working_directory {
            if dir.trim().is_empty() || dir.contains('\n') || dir.contains('\0') {
                return Err(Error::InvalidInput(format!(
                    "invalid working_directory: {dir:?}"
                )));
            }
        }
        Ok(())
    }

    /// The wait deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Output captured for one isolated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Text between the sentinels (or after the start sentinel on timeout)
    pub raw_text: String,
    /// Set on timeout and by the result shaper when the text is cut
    pub truncated: bool,
    /// Length of the untruncated text, in characters
    pub original_length: usize,
    /// When the capture completed
    pub captured_at: DateTime<Utc>,
    /// Exit status reported by the end sentinel
    pub exit_status: Option<i32>,
    /// The poll loop gave up before the end sentinel appeared
    pub timed_out: bool,
}

impl CapturedOutput {
    /// A capture for a command that ran to completion.
    pub fn completed(raw_text: String, exit_status: Option<i32>) -> Self {
        Self {
            original_length: raw_text.chars().count(),
            raw_text,
            truncated: false,
            captured_at: Utc::now(),
            exit_status,
            timed_out: false,
        }
    }

    /// A partial capture for a command that outlived its deadline.
    pub fn timed_out(partial: String) -> Self {
        Self {
            original_length: partial.chars().count(),
            raw_text: partial,
            truncated: true,
            captured_at: Utc::now(),
            exit_status: None,
            timed_out: true,
        }
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

/// What `execute_command` returns. Always well-formed, even on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Response {
    /// Whether the command was delivered (and, when isolated, observed)
    pub success: bool,
    /// Captured output, bounded by `max_output_chars`
    pub output: String,
    /// Output was cut, or the command did not finish in time
    pub truncated: bool,
    /// The wait deadline passed before the command finished
    #[serde(default)]
    pub timed_out: bool,
    /// Length of the output before truncation, in characters
    #[serde(default)]
    pub original_length: usize,
    /// Exit status of the command, when it finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Strategy used to deliver the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
    /// Pane the command ran in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// A failed response built from an engine error.
    pub fn failure(err: &Error, session_id: Option<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            truncated: false,
            timed_out: false,
            original_length: 0,
            exit_status: None,
            strategy: None,
            session_id,
            error: Some(ResponseError {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    /// Serialize, pretty-printed only while the output stays small.
    pub fn to_json(&self, compact_threshold_chars: usize) -> String {
        let rendered = if self.output.len() > compact_threshold_chars {
            serde_json::to_string(self)
        } else {
            serde_json::to_string_pretty(self)
        };
        rendered.unwrap_or_else(|e| {
            format!(r#"{{"success":false,"output":"","truncated":false,"error":{{"kind":"internal","message":"{e}"}}}}"#)
        })
    }
}

/// Diagnostic view of what the engine is holding on to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MemorySnapshot {
    /// Connections currently held by the pool
    pub pooled_connection_count: usize,
    /// Pooled connections with at least one outstanding lease
    pub in_use_connection_count: usize,
    /// Per-session execution locks currently tracked
    pub tracked_session_locks: usize,
    /// Rough size of pool and lock bookkeeping, in bytes
    pub estimated_bytes_held: usize,
}
