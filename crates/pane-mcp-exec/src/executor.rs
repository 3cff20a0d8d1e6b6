//! Command executor: the entry point tying pool, delivery, isolation and
//! shaping together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pane_mcp_core::{
    CapturedOutput, ContextKey, Error, ExecutionRequest, ExecutionSettings, Key, MemorySnapshot,
    Response, Result, ServerConfig, SessionHandle,
};
use pane_mcp_host::TerminalHost;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::isolation::{run_isolated, PollSettings};
use crate::pool::ConnectionPool;
use crate::shaper::{shape, truncate_chars};
use crate::strategy::{shell_quote, Deliveries};

type SessionLock = Arc<tokio::sync::Mutex<()>>;

/// A bounded read of a session's screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenRead {
    /// Pane that was read
    pub session_id: String,
    /// Screen text after the line and character bounds
    pub text: String,
    /// Lines on screen before bounding
    pub total_lines: usize,
    /// Whether either bound cut anything
    pub truncated: bool,
}

/// What the executor knows about a resolved session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Resolved handle
    pub handle: SessionHandle,
    /// Pooled connection serving the session
    pub connection_id: Uuid,
    /// When that connection was opened
    pub connected_at: DateTime<Utc>,
    /// Host backend name
    pub backend: &'static str,
}

/// Runs commands in terminal sessions and reports the results.
///
/// Commands aimed at the same pane run one at a time, in arrival order;
/// different panes run concurrently.
#[derive(Debug)]
pub struct CommandExecutor {
    pool: ConnectionPool,
    deliveries: Deliveries,
    settings: ExecutionSettings,
    poll: PollSettings,
    session_locks: Mutex<HashMap<String, SessionLock>>,
}

impl CommandExecutor {
    /// Create an executor for `host` using `config`.
    pub fn new(host: Arc<dyn TerminalHost>, config: &ServerConfig) -> Self {
        let settings = config.execution.clone();
        let poll = PollSettings {
            poll_interval: Duration::from_millis(settings.poll_interval_millis),
            max_polls: settings.max_polls,
            interrupt_on_timeout: settings.interrupt_on_timeout,
        };
        Self {
            pool: ConnectionPool::new(
                host,
                Duration::from_secs(config.pool.idle_window_seconds),
            ),
            deliveries: Deliveries::new(&config.host, settings.ambiguous_strategy),
            settings,
            poll,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Execution settings in effect.
    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// An isolated request for `command` with the configured defaults.
    pub fn request(&self, command: impl Into<String>) -> ExecutionRequest {
        ExecutionRequest {
            command: command.into(),
            timeout_seconds: self.settings.default_timeout_seconds,
            isolate_output: true,
            working_directory: None,
            max_output_chars: self.settings.max_output_chars,
            session_id: None,
        }
    }

    /// Run a command. Failures come back as an unsuccessful [`Response`],
    /// never as an error.
    pub async fn execute_command(&self, request: ExecutionRequest) -> Response {
        match self.try_execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("execute_command failed: {}", e);
                Response::failure(&e, request.session_id.clone())
            }
        }
    }

    async fn try_execute(&self, request: &ExecutionRequest) -> Result<Response> {
        request.validate()?;

        let lease = self
            .pool
            .acquire(ContextKey::from_session(request.session_id.as_deref()))
            .await?;
        let handle = lease.handle().clone();

        self.prune_session_locks();
        let session_lock = self.session_lock(&handle.session_id);
        let _turn = tokio::time::timeout(request.timeout(), session_lock.lock())
            .await
            .map_err(|_| Error::Timeout(request.timeout_seconds))?;

        info!(
            "Executing in {} (isolated: {}, timeout: {}s)",
            handle.session_id, request.isolate_output, request.timeout_seconds
        );

        let mut response = if request.isolate_output {
            let run = run_isolated(
                lease.connection(),
                &handle,
                &request.command,
                request.working_directory.as_deref(),
                request.timeout(),
                &self.deliveries,
                &self.poll,
            )
            .await?;
            let mut response = shape(&run.captured, request.max_output_chars);
            response.strategy = Some(run.strategy);
            response
        } else {
            let text = match &request.working_directory {
                Some(dir) => format!(
                    "cd -- {} && {{\n{}\n}}",
                    shell_quote(dir),
                    request.command.trim_end_matches('\n')
                ),
                None => request.command.clone(),
            };
            let strategy = self
                .deliveries
                .deliver(lease.connection(), &handle, &text)
                .await?;
            let mut response = shape(
                &CapturedOutput::completed(String::new(), None),
                request.max_output_chars,
            );
            response.strategy = Some(strategy);
            response
        };

        debug!(
            "Finished in {}: {} chars, truncated: {}, timed out: {}",
            handle.session_id, response.original_length, response.truncated, response.timed_out
        );
        response.session_id = Some(handle.session_id);
        Ok(response)
    }

    /// Close every idle pooled connection and drop unused session locks.
    /// Returns how many connections were closed.
    pub async fn cleanup_connections(&self) -> usize {
        let evicted = self.pool.force_cleanup().await;
        let dropped = self.prune_session_locks();
        debug!(
            "Cleanup closed {} connection(s), dropped {} session lock(s)",
            evicted, dropped
        );
        evicted
    }

    /// What the engine currently holds.
    pub fn memory_stats(&self) -> MemorySnapshot {
        let pool = self.pool.stats();
        let locks = lock(&self.session_locks);
        let lock_bytes: usize = locks
            .keys()
            .map(|id| {
                id.capacity()
                    + std::mem::size_of::<SessionLock>()
                    + std::mem::size_of::<tokio::sync::Mutex<()>>()
            })
            .sum();
        MemorySnapshot {
            pooled_connection_count: pool.pooled,
            in_use_connection_count: pool.in_use,
            tracked_session_locks: locks.len(),
            estimated_bytes_held: pool.estimated_bytes + lock_bytes,
        }
    }

    /// Send raw text to a session without waiting for anything.
    ///
    /// Not serialized with running commands, so it can answer prompts or
    /// interrupt a command that is still running.
    pub async fn send_text(&self, session_id: Option<&str>, text: &str) -> Result<SessionHandle> {
        if text.is_empty() {
            return Err(Error::InvalidInput("text cannot be empty".to_string()));
        }
        let lease = self.pool.acquire(ContextKey::from_session(session_id)).await?;
        lease.connection().send_text(lease.handle(), text).await?;
        debug!("Sent {} bytes to {}", text.len(), lease.handle().session_id);
        Ok(lease.handle().clone())
    }

    /// Send a named key such as `Enter` or `Ctrl+c`.
    pub async fn press_key(&self, session_id: Option<&str>, key: &str) -> Result<SessionHandle> {
        let key = Key::parse(key)?;
        self.send_text(session_id, &key.to_input()).await
    }

    /// Clear the visible screen. Scrollback is kept.
    pub async fn clear_screen(&self, session_id: Option<&str>) -> Result<SessionHandle> {
        self.send_text(session_id, &Key::CLEAR.to_input()).await
    }

    /// Read a session's screen, keeping the last `max_lines` lines and then
    /// at most `max_chars` characters.
    pub async fn read_output(
        &self,
        session_id: Option<&str>,
        include_scrollback: bool,
        max_lines: Option<usize>,
        max_chars: Option<usize>,
    ) -> Result<ScreenRead> {
        if max_lines == Some(0) {
            return Err(Error::InvalidInput("max_lines must be > 0".to_string()));
        }
        let max_chars = max_chars.unwrap_or(self.settings.max_output_chars);
        if max_chars == 0 {
            return Err(Error::InvalidInput(
                "max_output_chars must be > 0".to_string(),
            ));
        }

        let lease = self.pool.acquire(ContextKey::from_session(session_id)).await?;
        let screen = lease
            .connection()
            .get_screen_contents(lease.handle(), include_scrollback)
            .await?;

        let lines: Vec<&str> = screen.lines().collect();
        let total_lines = lines.len();
        let (tail, lines_cut) = match max_lines {
            Some(n) if n < total_lines => (lines[total_lines - n..].join("\n"), true),
            _ => (screen.clone(), false),
        };
        let (text, chars_cut) = truncate_chars(&tail, max_chars);

        Ok(ScreenRead {
            session_id: lease.handle().session_id.clone(),
            text,
            total_lines,
            truncated: lines_cut || chars_cut,
        })
    }

    /// Resolve a session and describe it.
    pub async fn session_info(&self, session_id: Option<&str>) -> Result<SessionInfo> {
        let lease = self.pool.acquire(ContextKey::from_session(session_id)).await?;
        Ok(SessionInfo {
            handle: lease.handle().clone(),
            connection_id: lease.connection_id(),
            connected_at: lease.connected_at(),
            backend: self.pool.host_name(),
        })
    }

    /// Every pane the host knows about.
    pub async fn list_sessions(&self) -> Result<Vec<SessionHandle>> {
        let lease = self.pool.acquire(ContextKey::Active).await?;
        lease.connection().list_sessions().await
    }

    /// Open a new tab next to the given (or active) session.
    pub async fn create_tab(&self, session_id: Option<&str>) -> Result<SessionHandle> {
        let lease = self.pool.acquire(ContextKey::from_session(session_id)).await?;
        let handle = lease.connection().create_tab(Some(lease.handle())).await?;
        info!("Created tab {} ({})", handle.tab_id, handle.session_id);
        Ok(handle)
    }

    /// Split the given (or active) session into a new one.
    pub async fn create_session(&self, session_id: Option<&str>) -> Result<SessionHandle> {
        let lease = self.pool.acquire(ContextKey::from_session(session_id)).await?;
        let handle = lease.connection().create_session(lease.handle()).await?;
        info!("Created session {} in tab {}", handle.session_id, handle.tab_id);
        Ok(handle)
    }

    /// Close everything the pool holds. Used on shutdown.
    pub async fn shutdown(&self) -> usize {
        let closed = self.cleanup_connections().await;
        info!("Executor shut down, closed {} connection(s)", closed);
        closed
    }

    /// Drop locks no command holds or waits for. Returns how many went.
    fn prune_session_locks(&self) -> usize {
        let mut locks = lock(&self.session_locks);
        let before = locks.len();
        locks.retain(|_, session_lock| Arc::strong_count(session_lock) > 1);
        before - locks.len()
    }

    fn session_lock(&self, session_id: &str) -> SessionLock {
        let mut locks = lock(&self.session_locks);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
