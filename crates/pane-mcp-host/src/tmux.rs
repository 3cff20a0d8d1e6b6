//! tmux backend.
//!
//! Talks to a running tmux server through its command-line client. Panes map
//! onto [`SessionHandle`] as pane id (`%3`), window id (`@1`) and tmux
//! session id (`$0`).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pane_mcp_core::{Error, HostSettings, Result, SessionHandle};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::host::{parse_pane_line, trim_trailing_blank_lines, HostConnection, TerminalHost};

/// `-F` format that prints one pane as `$session\t@window\t%pane`.
pub const PANE_FORMAT: &str = "#{session_id}\t#{window_id}\t#{pane_id}";

/// Bytes per `send-keys -H` invocation, keeps argument lists short.
const SEND_KEYS_CHUNK: usize = 1024;

/// A tmux server, selected by socket path or the user's default server.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    socket: Option<String>,
    scrollback_lines: usize,
}

impl TmuxHost {
    /// Create a host from configuration.
    pub fn new(settings: &HostSettings) -> Self {
        Self {
            socket: settings.tmux_socket.clone(),
            scrollback_lines: settings.scrollback_lines,
        }
    }

    /// Create a host bound to an explicit socket path.
    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: Some(socket.into()),
            scrollback_lines: HostSettings::default().scrollback_lines,
        }
    }
}

#[async_trait]
impl TerminalHost for TmuxHost {
    fn name(&self) -> &'static str {
        "tmux"
    }

    async fn connect(&self) -> Result<Arc<dyn HostConnection>> {
        let conn = TmuxConnection {
            id: Uuid::new_v4(),
            socket: self.socket.clone(),
            scrollback_lines: self.scrollback_lines,
            closed: AtomicBool::new(false),
        };
        conn.probe().await?;
        info!(connection_id = %conn.id, socket = ?conn.socket, "Connected to tmux server");
        Ok(Arc::new(conn))
    }
}

/// One logical connection to a tmux server.
///
/// The tmux client is stateless, so the connection only carries the socket
/// and an identity; every operation spawns a short-lived client process.
#[derive(Debug)]
pub struct TmuxConnection {
    id: Uuid,
    socket: Option<String>,
    scrollback_lines: usize,
    closed: AtomicBool,
}

impl TmuxConnection {
    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.arg("-S").arg(socket);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection(format!(
                "tmux connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    /// Run a tmux subcommand and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        self.ensure_open()?;

        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Connection(format!("Failed to run tmux: {e}")))?;

        if !output.status.success() {
            return Err(tmux_failure(args, &output.stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_for_pane(&self, args: &[&str]) -> Result<SessionHandle> {
        let stdout = self.run(args).await?;
        parse_pane_line(stdout.trim()).ok_or_else(|| {
            Error::Host(format!("Unexpected tmux pane description: {stdout:?}"))
        })
    }

    async fn load_buffer(&self, buffer: &str, text: &str) -> Result<()> {
        self.ensure_open()?;

        let mut child = self
            .command()
            .args(["load-buffer", "-b", buffer, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Connection(format!("Failed to run tmux: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(tmux_failure(&["load-buffer"], &output.stderr));
        }
        Ok(())
    }
}

#[async_trait]
impl HostConnection for TmuxConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn current_session(&self) -> Result<SessionHandle> {
        self.run_for_pane(&["display-message", "-p", PANE_FORMAT])
            .await
    }

    async fn resolve_session(&self, session_id: &str) -> Result<SessionHandle> {
        match self
            .run_for_pane(&["display-message", "-p", "-t", session_id, PANE_FORMAT])
            .await
        {
            Ok(handle) if handle.session_id == session_id => Ok(handle),
            Ok(_) | Err(Error::Host(_)) => Err(Error::SessionNotFound(session_id.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionHandle>> {
        let stdout = self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await?;
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        debug!(
            "Sending {} bytes to tmux pane '{}' via hex mode",
            text.len(),
            session.session_id
        );

        // -H delivers each byte literally, escape sequences included
        for chunk in hex_chunks(text.as_bytes()) {
            let mut args = vec!["send-keys", "-t", session.session_id.as_str(), "-H"];
            args.extend(chunk.iter().map(String::as_str));
            self.run(&args).await?;
        }
        Ok(())
    }

    async fn inject_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let buffer = format!("pane-mcp-{}", Uuid::new_v4().simple());
        debug!(
            "Injecting {} bytes into tmux pane '{}' through buffer {}",
            text.len(),
            session.session_id,
            buffer
        );

        self.load_buffer(&buffer, text).await?;

        // -p wraps the paste in bracketed-paste markers when the shell asked for them
        let pasted = self
            .run(&[
                "paste-buffer",
                "-d",
                "-p",
                "-b",
                &buffer,
                "-t",
                &session.session_id,
            ])
            .await;

        if let Err(e) = pasted {
            if let Err(cleanup) = self.run(&["delete-buffer", "-b", &buffer]).await {
                warn!("Failed to delete tmux buffer {}: {}", buffer, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get_screen_contents(
        &self,
        session: &SessionHandle,
        include_scrollback: bool,
    ) -> Result<String> {
        let start = format!("-{}", self.scrollback_lines);
        let mut args = vec!["capture-pane", "-p", "-J", "-t", session.session_id.as_str()];
        if include_scrollback {
            args.extend(["-S", start.as_str()]);
        }
        let stdout = self.run(&args).await?;
        Ok(trim_trailing_blank_lines(&stdout))
    }

    async fn create_tab(&self, session: Option<&SessionHandle>) -> Result<SessionHandle> {
        let handle = match session {
            Some(session) => {
                self.run_for_pane(&[
                    "new-window",
                    "-a",
                    "-P",
                    "-F",
                    PANE_FORMAT,
                    "-t",
                    &session.tab_id,
                ])
                .await?
            }
            None => {
                self.run_for_pane(&["new-window", "-P", "-F", PANE_FORMAT])
                    .await?
            }
        };
        info!("Created tmux window {} (pane {})", handle.tab_id, handle.session_id);
        Ok(handle)
    }

    async fn create_session(&self, session: &SessionHandle) -> Result<SessionHandle> {
        let handle = self
            .run_for_pane(&[
                "split-window",
                "-P",
                "-F",
                PANE_FORMAT,
                "-t",
                &session.session_id,
            ])
            .await?;
        info!("Split tmux pane {} into {}", session.session_id, handle.session_id);
        Ok(handle)
    }

    async fn probe(&self) -> Result<()> {
        self.run(&["list-sessions", "-F", "#{session_id}"]).await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.id, "Closed tmux connection");
        }
    }
}

/// Split bytes into `send-keys -H` argument groups.
fn hex_chunks(data: &[u8]) -> Vec<Vec<String>> {
    data.chunks(SEND_KEYS_CHUNK)
        .map(|chunk| chunk.iter().map(|b| format!("{b:02x}")).collect())
        .collect()
}

/// Map a failed tmux invocation onto an error category.
fn tmux_failure(args: &[&str], stderr: &[u8]) -> Error {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    let subcommand = args.first().copied().unwrap_or("tmux");

    if stderr.contains("no server running")
        || stderr.contains("error connecting to")
        || stderr.contains("server exited")
    {
        Error::Connection(stderr)
    } else if stderr.contains("can't find") {
        Error::SessionNotFound(stderr)
    } else {
        Error::Host(format!("tmux {subcommand} failed: {stderr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_connection() -> TmuxConnection {
        TmuxConnection {
            id: Uuid::new_v4(),
            socket: None,
            scrollback_lines: 100,
            closed: AtomicBool::new(true),
        }
    }

    #[test]
    fn test_hex_chunks() {
        let chunks = hex_chunks(b"ls\n\x1b");
        assert_eq!(chunks, vec![vec!["6c", "73", "0a", "1b"]]);

        let big = vec![b'a'; SEND_KEYS_CHUNK * 2 + 1];
        let chunks = hex_chunks(&big);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec!["61"]);
    }

    #[test]
    fn test_hex_chunks_utf8_bytes() {
        let chunks = hex_chunks("é".as_bytes());
        assert_eq!(chunks, vec![vec!["c3", "a9"]]);
    }

    #[test]
    fn test_tmux_failure_classification() {
        let err = tmux_failure(&["list-sessions"], b"no server running on /tmp/tmux-0/default\n");
        assert!(matches!(err, Error::Connection(_)));

        let err = tmux_failure(
            &["display-message"],
            b"error connecting to /tmp/nope (No such file or directory)",
        );
        assert!(matches!(err, Error::Connection(_)));

        let err = tmux_failure(&["send-keys"], b"can't find pane: %42");
        assert!(matches!(err, Error::SessionNotFound(_)));

        let err = tmux_failure(&["paste-buffer"], b"no buffer pane-mcp-x");
        assert!(matches!(err, Error::Host(ref msg) if msg.starts_with("tmux paste-buffer failed")));
    }

    #[test]
    fn test_with_socket() {
        let host = TmuxHost::with_socket("/tmp/pane-mcp-test.sock");
        assert_eq!(host.socket.as_deref(), Some("/tmp/pane-mcp-test.sock"));
        assert_eq!(host.scrollback_lines, 10_000);
        assert_eq!(host.name(), "tmux");
    }

    #[tokio::test]
    async fn test_connect_to_missing_server_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("absent.sock");
        let host = TmuxHost::with_socket(socket.to_string_lossy());

        let err = host.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let conn = closed_connection();
        let handle = SessionHandle::new("%0", "$0", "@0");

        assert!(matches!(conn.probe().await, Err(Error::Connection(_))));
        assert!(matches!(
            conn.send_text(&handle, "ls\n").await,
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            conn.inject_text(&handle, "ls").await,
            Err(Error::Connection(_))
        ));
    }
}
