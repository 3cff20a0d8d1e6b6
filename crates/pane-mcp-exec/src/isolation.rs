//! Output isolation: bracket a command with unique sentinels and extract
//! exactly what it printed.
//!
//! The wrapper prints `PANE_MCP_BEGIN_<token>` before the command and
//! `PANE_MCP_END_<token>:<status>` after it. Both are produced by `printf`
//! with the prefix and the token as separate arguments, so the echoed input
//! never contains a sentinel and cannot be mistaken for one.
//!
//! A timed-out command is not stopped unless `interrupt_on_timeout` is set;
//! it keeps running in the pane after the call returns.

use std::time::Duration;

use pane_mcp_core::{CapturedOutput, ExecutionStrategy, Key, Result, SessionHandle};
use pane_mcp_host::HostConnection;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::strategy::{shell_quote, Deliveries};

/// Prefix of the line printed before the command runs.
pub const START_PREFIX: &str = "PANE_MCP_BEGIN";

/// Prefix of the line printed after the command exits.
pub const END_PREFIX: &str = "PANE_MCP_END";

/// Deadline used when `now + timeout` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Sentinels for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationMarker {
    token: String,
    start_sentinel: String,
    end_sentinel_prefix: String,
}

impl Default for IsolationMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationMarker {
    /// A marker with a fresh random token.
    pub fn new() -> Self {
        Self::with_token(Uuid::new_v4().simple().to_string())
    }

    /// A marker with a given token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            start_sentinel: format!("{START_PREFIX}_{token}"),
            end_sentinel_prefix: format!("{END_PREFIX}_{token}:"),
            token,
        }
    }

    /// The random part shared by both sentinels.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The exact start line.
    pub fn start_sentinel(&self) -> &str {
        &self.start_sentinel
    }

    /// The end line up to and including the `:` before the exit status.
    pub fn end_sentinel_prefix(&self) -> &str {
        &self.end_sentinel_prefix
    }

    /// Wrap `command` so it prints both sentinels, optionally inside a
    /// working directory. The result always spans several lines.
    pub fn wrap(&self, command: &str, working_directory: Option<&str>) -> String {
        let command = command.trim_end_matches('\n');
        let mut lines = vec![format!(
            "printf '%s_%s\\n' {START_PREFIX} {}",
            self.token
        )];
        match working_directory {
            Some(dir) => {
                lines.push(format!("cd -- {} && {{", shell_quote(dir)));
                lines.push(command.to_string());
                lines.push("}".to_string());
            }
            None => lines.push(command.to_string()),
        }
        lines.push(format!(
            "printf '%s_%s:%s\\n' {END_PREFIX} {} \"$?\"",
            self.token
        ));
        lines.join("\n")
    }
}

/// What a screen read revealed about a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The start sentinel is not on screen yet
    NotStarted,
    /// Started; the text printed so far
    Partial(String),
    /// Finished; the full output and its exit status
    Complete {
        /// Text between the sentinels
        output: String,
        /// Status from the end sentinel
        exit_status: Option<i32>,
    },
    /// Finished, but the start sentinel already scrolled out of the capture.
    /// The output is only the tail that was still on screen.
    Clipped {
        /// Text before the end sentinel
        output: String,
        /// Status from the end sentinel
        exit_status: Option<i32>,
    },
}

/// Find the command's output in a screen capture.
///
/// Uses the last line equal to the start sentinel, then the first end
/// sentinel after it. Without a start line, an end sentinel alone still
/// means the command finished.
pub fn extract(screen: &str, marker: &IsolationMarker) -> Extraction {
    let lines: Vec<&str> = screen.lines().collect();
    let Some(start) = lines
        .iter()
        .rposition(|line| line.trim_end() == marker.start_sentinel)
    else {
        return match find_end(&lines, marker) {
            Some((end, exit_status)) => Extraction::Clipped {
                output: lines[..end].join("\n"),
                exit_status,
            },
            None => Extraction::NotStarted,
        };
    };

    let after = &lines[start + 1..];
    match find_end(after, marker) {
        Some((end, exit_status)) => Extraction::Complete {
            output: after[..end].join("\n"),
            exit_status,
        },
        None => Extraction::Partial(after.join("\n")),
    }
}

fn find_end(lines: &[&str], marker: &IsolationMarker) -> Option<(usize, Option<i32>)> {
    lines.iter().enumerate().find_map(|(i, line)| {
        line.trim_end()
            .strip_prefix(marker.end_sentinel_prefix.as_str())
            .map(|status| (i, status.trim().parse::<i32>().ok()))
    })
}

/// Progress of one isolated run, advanced on every screen read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationState {
    /// Waiting for the start sentinel
    AwaitingStart,
    /// Start seen, waiting for the end sentinel
    AwaitingEnd {
        /// Output so far
        partial: String,
    },
    /// The end sentinel seen
    Matched {
        /// Text between the sentinels
        output: String,
        /// Status from the end sentinel
        exit_status: Option<i32>,
        /// The start of the output had scrolled away
        clipped: bool,
    },
    /// The deadline passed first
    TimedOut {
        /// Output after the start sentinel, empty if it never appeared
        partial: String,
    },
}

impl IsolationState {
    /// Apply a screen read. Terminal states do not change.
    pub fn advance(self, screen: &str, marker: &IsolationMarker) -> Self {
        if self.is_terminal() {
            return self;
        }
        match extract(screen, marker) {
            Extraction::NotStarted => IsolationState::AwaitingStart,
            Extraction::Partial(partial) => IsolationState::AwaitingEnd { partial },
            Extraction::Complete {
                output,
                exit_status,
            } => IsolationState::Matched {
                output,
                exit_status,
                clipped: false,
            },
            Extraction::Clipped {
                output,
                exit_status,
            } => IsolationState::Matched {
                output,
                exit_status,
                clipped: true,
            },
        }
    }

    /// Give up waiting, keeping whatever was captured.
    pub fn time_out(self) -> Self {
        match self {
            IsolationState::AwaitingStart => IsolationState::TimedOut {
                partial: String::new(),
            },
            IsolationState::AwaitingEnd { partial } => IsolationState::TimedOut { partial },
            terminal => terminal,
        }
    }

    /// `Matched` or `TimedOut`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IsolationState::Matched { .. } | IsolationState::TimedOut { .. }
        )
    }

    /// Convert a terminal state into captured output.
    pub fn into_captured(self) -> Option<CapturedOutput> {
        match self {
            IsolationState::Matched {
                output,
                exit_status,
                clipped,
            } => {
                let mut captured = CapturedOutput::completed(output, exit_status);
                captured.truncated = clipped;
                Some(captured)
            }
            IsolationState::TimedOut { partial } => Some(CapturedOutput::timed_out(partial)),
            _ => None,
        }
    }
}

/// Poll loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between screen reads
    pub poll_interval: Duration,
    /// Hard cap on screen reads
    pub max_polls: u32,
    /// Send Ctrl+C when the deadline passes
    pub interrupt_on_timeout: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_polls: 10_000,
            interrupt_on_timeout: false,
        }
    }
}

/// An isolated command: what it printed and how it was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedRun {
    /// Captured output
    pub captured: CapturedOutput,
    /// Delivery strategy used for the wrapped text
    pub strategy: ExecutionStrategy,
}

/// Deliver `command` wrapped in fresh sentinels and wait for its output.
pub async fn run_isolated(
    conn: &dyn HostConnection,
    handle: &SessionHandle,
    command: &str,
    working_directory: Option<&str>,
    timeout: Duration,
    deliveries: &Deliveries,
    poll: &PollSettings,
) -> Result<IsolatedRun> {
    let marker = IsolationMarker::new();
    let wrapped = marker.wrap(command, working_directory);
    let strategy = deliveries.deliver(conn, handle, &wrapped).await?;

    let now = Instant::now();
    let deadline = now
        .checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE);
    let mut state = IsolationState::AwaitingStart;
    let mut polls = 0u32;

    loop {
        let screen = conn.get_screen_contents(handle, true).await?;
        polls += 1;
        state = state.advance(&screen, &marker);
        if state.is_terminal() {
            break;
        }

        let now = Instant::now();
        if now >= deadline || polls >= poll.max_polls {
            state = state.time_out();
            break;
        }
        tokio::time::sleep(poll.poll_interval.min(deadline - now)).await;
    }

    debug!(
        "Isolated run in {} finished after {} polls (token {})",
        handle.session_id,
        polls,
        marker.token()
    );

    if matches!(state, IsolationState::TimedOut { .. }) {
        warn!(
            "Command in {} did not finish within {:?}; it may still be running",
            handle.session_id, timeout
        );
        if poll.interrupt_on_timeout {
            if let Err(e) = conn.send_text(handle, &Key::INTERRUPT.to_input()).await {
                warn!("Failed to interrupt {}: {}", handle.session_id, e);
            }
        }
    }

    let captured = state
        .into_captured()
        .unwrap_or_else(|| CapturedOutput::timed_out(String::new()));
    Ok(IsolatedRun { captured, strategy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pane_mcp_core::HostSettings;
    use pane_mcp_host::{MemoryHost, TerminalHost};
    use std::sync::Arc;

    fn deliveries() -> Deliveries {
        Deliveries::new(&HostSettings::default(), ExecutionStrategy::BracketedPaste)
    }

    async fn session() -> (MemoryHost, Arc<dyn HostConnection>, SessionHandle) {
        let host = MemoryHost::new();
        let conn = host.connect().await.unwrap();
        let handle = conn.current_session().await.unwrap();
        (host, conn, handle)
    }

    #[test]
    fn test_marker_tokens_are_unique() {
        let a = IsolationMarker::new();
        let b = IsolationMarker::new();
        assert_ne!(a.token(), b.token());
        assert_eq!(a.token().len(), 32);
        assert!(a.token().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.start_sentinel(), format!("PANE_MCP_BEGIN_{}", a.token()));
        assert_eq!(a.end_sentinel_prefix(), format!("PANE_MCP_END_{}:", a.token()));
    }

    #[test]
    fn test_wrap_never_contains_sentinels() {
        let marker = IsolationMarker::with_token("abc123");
        let wrapped = marker.wrap("echo hi", Some("/tmp/it's here"));

        assert!(!wrapped.contains(marker.start_sentinel()));
        assert!(!wrapped.contains(marker.end_sentinel_prefix()));
        assert_eq!(
            wrapped,
            "printf '%s_%s\\n' PANE_MCP_BEGIN abc123\n\
             cd -- '/tmp/it'\\''s here' && {\n\
             echo hi\n\
             }\n\
             printf '%s_%s:%s\\n' PANE_MCP_END abc123 \"$?\""
        );
    }

    #[test]
    fn test_wrap_is_multiline() {
        let marker = IsolationMarker::new();
        assert!(marker.wrap("ls", None).lines().count() >= 3);
    }

    #[test]
    fn test_extract_complete() {
        let marker = IsolationMarker::with_token("t1");
        let screen = "$ printf ...\nPANE_MCP_BEGIN_t1\nhello\nworld\nPANE_MCP_END_t1:0\n$ ";
        assert_eq!(
            extract(screen, &marker),
            Extraction::Complete {
                output: "hello\nworld".to_string(),
                exit_status: Some(0)
            }
        );
    }

    #[test]
    fn test_extract_partial_and_not_started() {
        let marker = IsolationMarker::with_token("t1");
        assert_eq!(extract("$ ls\n", &marker), Extraction::NotStarted);
        assert_eq!(
            extract("PANE_MCP_BEGIN_t1\nstill going", &marker),
            Extraction::Partial("still going".to_string())
        );
    }

    #[test]
    fn test_extract_ignores_other_tokens() {
        let marker = IsolationMarker::with_token("new");
        let screen = "PANE_MCP_BEGIN_old\nold output\nPANE_MCP_END_old:0\n\
                      PANE_MCP_BEGIN_new\nnew output\nPANE_MCP_END_new:2";
        assert_eq!(
            extract(screen, &marker),
            Extraction::Complete {
                output: "new output".to_string(),
                exit_status: Some(2)
            }
        );
    }

    #[test]
    fn test_extract_uses_last_start_sentinel() {
        let marker = IsolationMarker::with_token("t");
        let screen = "PANE_MCP_BEGIN_t\nfirst\nPANE_MCP_BEGIN_t\nsecond\nPANE_MCP_END_t:0";
        assert_eq!(
            extract(screen, &marker),
            Extraction::Complete {
                output: "second".to_string(),
                exit_status: Some(0)
            }
        );
    }

    #[test]
    fn test_extract_empty_output() {
        let marker = IsolationMarker::with_token("t");
        assert_eq!(
            extract("PANE_MCP_BEGIN_t\nPANE_MCP_END_t:1", &marker),
            Extraction::Complete {
                output: String::new(),
                exit_status: Some(1)
            }
        );
    }

    #[test]
    fn test_extract_clipped_when_start_scrolled_away() {
        let marker = IsolationMarker::with_token("t1");
        let screen = "9998\n9999\n10000\nPANE_MCP_END_t1:0\n$ ";
        assert_eq!(
            extract(screen, &marker),
            Extraction::Clipped {
                output: "9998\n9999\n10000".to_string(),
                exit_status: Some(0)
            }
        );

        // Another command's end line is not ours
        assert_eq!(
            extract("out\nPANE_MCP_END_t0:0\n$ ", &marker),
            Extraction::NotStarted
        );

        let captured = IsolationState::AwaitingStart
            .advance(screen, &marker)
            .into_captured()
            .unwrap();
        assert!(captured.truncated);
        assert!(!captured.timed_out);
        assert_eq!(captured.exit_status, Some(0));
    }

    #[test]
    fn test_state_machine() {
        let marker = IsolationMarker::with_token("s");
        let state = IsolationState::AwaitingStart.advance("$ ", &marker);
        assert_eq!(state, IsolationState::AwaitingStart);

        let state = state.advance("PANE_MCP_BEGIN_s\nx", &marker);
        assert_eq!(
            state,
            IsolationState::AwaitingEnd {
                partial: "x".to_string()
            }
        );

        let state = state.advance("PANE_MCP_BEGIN_s\nx\nPANE_MCP_END_s:0", &marker);
        assert!(state.is_terminal());

        // Terminal states stay put
        let again = state.clone().advance("", &marker).time_out();
        assert_eq!(again, state);
    }

    #[test]
    fn test_time_out_keeps_partial() {
        let state = IsolationState::AwaitingEnd {
            partial: "half".to_string(),
        }
        .time_out();
        let captured = state.into_captured().unwrap();
        assert!(captured.timed_out);
        assert!(captured.truncated);
        assert_eq!(captured.raw_text, "half");

        assert_eq!(
            IsolationState::AwaitingStart.time_out(),
            IsolationState::TimedOut {
                partial: String::new()
            }
        );
        assert!(IsolationState::AwaitingStart.into_captured().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_hello_world() {
        let (_host, conn, handle) = session().await;

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "echo hello world",
            None,
            Duration::from_secs(10),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.captured.raw_text, "hello world");
        assert_eq!(run.captured.exit_status, Some(0));
        assert!(!run.captured.timed_out);
        assert!(run.strategy.is_atomic());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_reports_exit_status() {
        let (_host, conn, handle) = session().await;

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "no-such-tool --version",
            None,
            Duration::from_secs(10),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.captured.exit_status, Some(127));
        assert!(run.captured.raw_text.contains("command not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, conn, handle) = session().await;
        let cwd = dir.path().display().to_string();

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "pwd",
            Some(&cwd),
            Duration::from_secs(10),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.captured.raw_text, cwd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_timeout_returns_partial() {
        let (host, conn, handle) = session().await;

        let started = Instant::now();
        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "echo begun; sleep 30; echo finished",
            None,
            Duration::from_secs(2),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert!(run.captured.timed_out);
        assert!(run.captured.truncated);
        assert_eq!(run.captured.raw_text, "begun");
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));

        // Not interrupted: the command is still running
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(host.history("%0").unwrap().contains(&"finished".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_interrupts_when_asked() {
        let (host, conn, handle) = session().await;
        let poll = PollSettings {
            interrupt_on_timeout: true,
            ..PollSettings::default()
        };

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "sleep 30; echo finished",
            None,
            Duration::from_secs(1),
            &deliveries(),
            &poll,
        )
        .await
        .unwrap();
        assert!(run.captured.timed_out);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!host.history("%0").unwrap().contains(&"finished".to_string()));
        assert_eq!(host.last_status("%0").unwrap(), 130);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_output_longer_than_capture() {
        let host = MemoryHost::with_scrollback(10);
        let conn = host.connect().await.unwrap();
        let handle = conn.current_session().await.unwrap();

        let started = Instant::now();
        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "seq 200",
            None,
            Duration::from_secs(10),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert!(!run.captured.timed_out);
        assert!(run.captured.truncated);
        assert_eq!(run.captured.exit_status, Some(0));
        assert!(run.captured.raw_text.ends_with("199\n200"));
        assert!(!run.captured.raw_text.contains("PANE_MCP"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_unrepresentable_timeout() {
        let (_host, conn, handle) = session().await;

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "echo quick",
            None,
            Duration::from_secs(u64::MAX),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.captured.raw_text, "quick");
        assert!(!run.captured.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_respects_max_polls() {
        let (_host, conn, handle) = session().await;
        let poll = PollSettings {
            max_polls: 3,
            ..PollSettings::default()
        };

        let started = Instant::now();
        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "sleep 100",
            None,
            Duration::from_secs(60),
            &deliveries(),
            &poll,
        )
        .await
        .unwrap();

        assert!(run.captured.timed_out);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_marker_isolation() {
        let (_host, conn, handle) = session().await;

        let slow = run_isolated(
            conn.as_ref(),
            &handle,
            "sleep 3; echo first",
            None,
            Duration::from_secs(1),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();
        assert!(slow.captured.timed_out);

        let next = run_isolated(
            conn.as_ref(),
            &handle,
            "echo second",
            None,
            Duration::from_secs(10),
            &deliveries(),
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert!(!next.captured.timed_out);
        assert_eq!(next.captured.raw_text, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_isolated_heredoc() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, conn, handle) = session().await;
        let settings = HostSettings {
            script_dir: Some(dir.path().to_path_buf()),
            ..HostSettings::default()
        };
        let deliveries = Deliveries::new(&settings, ExecutionStrategy::BracketedPaste);

        let run = run_isolated(
            conn.as_ref(),
            &handle,
            "cat <<'EOF'\nline one\nline two\nEOF",
            None,
            Duration::from_secs(10),
            &deliveries,
            &PollSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.strategy, ExecutionStrategy::ScriptFile);
        assert_eq!(run.captured.raw_text, "line one\nline two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
