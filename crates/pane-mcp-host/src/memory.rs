//! In-process host backed by a tiny scripted shell.
//!
//! Each pane keeps a line history, echoes submitted input after a `$ `
//! prompt and interprets a handful of builtins (`echo`, `printf`, `cd`,
//! `pwd`, `seq`, `cat`, `sleep`, `true`, `false`, `exit`, `clear`), `&&`,
//! `||` and `;` lists, `cmd && {` blocks, heredocs, and script files run by
//! path. `sleep` holds the queued input until tokio time passes, so tests
//! can drive long-running commands with a paused clock.
//!
//! Used by the test suites and by `--host memory` for dry runs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pane_mcp_core::{Error, Result, SessionHandle};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::host::{trim_trailing_blank_lines, HostConnection, TerminalHost};

/// Prompt printed before every submitted line.
pub const PROMPT: &str = "$ ";

const CONTINUATION_PROMPT: &str = "> ";
const HISTORY_LIMIT: usize = 50_000;
const DEFAULT_ROWS: usize = 24;
const DEFAULT_SCROLLBACK: usize = 10_000;
const MAX_SLEEP: Duration = Duration::from_secs(86400 * 365 * 30);
const MAX_SEQ_SPAN: i64 = 1_000_000;

/// A scripted terminal host. Clones share the same panes.
#[derive(Debug, Clone)]
pub struct MemoryHost {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<HostState>,
    reachable: AtomicBool,
    failing_probes: AtomicUsize,
    connects: AtomicUsize,
    rows: usize,
    scrollback_lines: usize,
}

#[derive(Debug)]
struct HostState {
    panes: Vec<Pane>,
    active: Option<String>,
    next_pane: usize,
    next_window: usize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host with one pane (`%0` in window `@0` of session `$0`).
    pub fn new() -> Self {
        Self::with_scrollback(DEFAULT_SCROLLBACK)
    }

    /// Same as [`MemoryHost::new`] with a custom scrollback depth.
    pub fn with_scrollback(scrollback_lines: usize) -> Self {
        let first = Pane::new(SessionHandle::new("%0", "$0", "@0"));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HostState {
                    active: Some(first.handle.session_id.clone()),
                    panes: vec![first],
                    next_pane: 1,
                    next_window: 1,
                }),
                reachable: AtomicBool::new(true),
                failing_probes: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                rows: DEFAULT_ROWS,
                scrollback_lines,
            }),
        }
    }

    /// Make the host accept or refuse connections and probes.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` probes on any connection.
    pub fn fail_probes(&self, count: usize) {
        self.inner.failing_probes.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Add a pane in a new window without making it active.
    pub fn spawn_pane(&self) -> SessionHandle {
        let mut state = self.inner.lock();
        let window = state.allocate_window();
        state.add_pane("$0", window)
    }

    /// Close a pane as if its shell exited. Returns whether it existed.
    pub fn close_pane(&self, session_id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.pane_mut(session_id) {
            Ok(pane) => {
                pane.alive = false;
                true
            }
            Err(_) => false,
        }
    }

    /// Write output into a pane as if a background job printed it.
    pub fn print(&self, session_id: &str, text: &str) -> Result<()> {
        let mut state = self.inner.lock();
        state.pane_mut(session_id)?.print(text);
        Ok(())
    }

    /// Full line history of a pane, prompt line excluded. Runs any input
    /// whose wait has elapsed first.
    pub fn history(&self, session_id: &str) -> Result<Vec<String>> {
        let mut state = self.inner.lock();
        let pane = state.pane_mut(session_id)?;
        pane.run_ready(Instant::now());
        Ok(pane.history.clone())
    }

    /// Exit status of the last command a pane ran.
    pub fn last_status(&self, session_id: &str) -> Result<i32> {
        let mut state = self.inner.lock();
        let pane = state.pane_mut(session_id)?;
        pane.run_ready(Instant::now());
        Ok(pane.last_status)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostState {
    fn pane_mut(&mut self, session_id: &str) -> Result<&mut Pane> {
        self.panes
            .iter_mut()
            .find(|pane| pane.alive && pane.handle.session_id == session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    fn allocate_window(&mut self) -> String {
        let id = format!("@{}", self.next_window);
        self.next_window += 1;
        id
    }

    fn add_pane(&mut self, window_id: &str, tab_id: String) -> SessionHandle {
        let handle = SessionHandle::new(format!("%{}", self.next_pane), window_id, tab_id);
        self.next_pane += 1;
        self.panes.push(Pane::new(handle.clone()));
        handle
    }
}

#[async_trait]
impl TerminalHost for MemoryHost {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn HostConnection>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory host is unreachable".to_string()));
        }
        let conn = MemoryConnection {
            id: Uuid::new_v4(),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        };
        debug!(connection_id = %conn.id, "Connected to memory host");
        Ok(Arc::new(conn))
    }
}

/// Connection to a [`MemoryHost`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: Uuid,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection(format!(
                "memory connection {} is closed",
                self.id
            )));
        }
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory host is unreachable".to_string()));
        }
        Ok(self.inner.lock())
    }
}

#[async_trait]
impl HostConnection for MemoryConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn current_session(&self) -> Result<SessionHandle> {
        let mut state = self.state()?;
        let active = state
            .active
            .clone()
            .ok_or_else(|| Error::SessionNotFound("active".to_string()))?;
        Ok(state.pane_mut(&active)?.handle.clone())
    }

    async fn resolve_session(&self, session_id: &str) -> Result<SessionHandle> {
        let mut state = self.state()?;
        Ok(state.pane_mut(session_id)?.handle.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionHandle>> {
        let state = self.state()?;
        Ok(state
            .panes
            .iter()
            .filter(|pane| pane.alive)
            .map(|pane| pane.handle.clone())
            .collect())
    }

    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let mut state = self.state()?;
        state.pane_mut(&session.session_id)?.feed(text, Instant::now());
        Ok(())
    }

    async fn inject_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let mut state = self.state()?;
        let pane = state.pane_mut(&session.session_id)?;
        pane.input.push_str(text);
        pane.run_ready(Instant::now());
        Ok(())
    }

    async fn get_screen_contents(
        &self,
        session: &SessionHandle,
        include_scrollback: bool,
    ) -> Result<String> {
        let scrollback = include_scrollback.then_some(self.inner.scrollback_lines);
        let mut state = self.state()?;
        let pane = state.pane_mut(&session.session_id)?;
        pane.run_ready(Instant::now());
        Ok(pane.render(self.inner.rows, scrollback))
    }

    async fn create_tab(&self, session: Option<&SessionHandle>) -> Result<SessionHandle> {
        let mut state = self.state()?;
        let window_id = match session {
            Some(session) => state.pane_mut(&session.session_id)?.handle.window_id.clone(),
            None => "$0".to_string(),
        };
        let tab = state.allocate_window();
        let handle = state.add_pane(&window_id, tab);
        state.active = Some(handle.session_id.clone());
        Ok(handle)
    }

    async fn create_session(&self, session: &SessionHandle) -> Result<SessionHandle> {
        let mut state = self.state()?;
        let parent = state.pane_mut(&session.session_id)?.handle.clone();
        let handle = state.add_pane(&parent.window_id, parent.tab_id);
        state.active = Some(handle.session_id.clone());
        Ok(handle)
    }

    async fn probe(&self) -> Result<()> {
        drop(self.state()?);
        let failing = &self.inner.failing_probes;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connection("memory host probe failed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    Then,
    And,
    Or,
}

#[derive(Debug, Clone)]
struct QueuedLine {
    text: String,
    script: Option<u64>,
    guard: Option<Connector>,
}

impl QueuedLine {
    fn typed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            script: None,
            guard: None,
        }
    }
}

#[derive(Debug)]
struct Heredoc {
    delimiter: String,
    strip_tabs: bool,
    print: bool,
    body: Vec<String>,
}

#[derive(Debug)]
struct Pane {
    handle: SessionHandle,
    history: Vec<String>,
    screen_top: usize,
    input: String,
    in_paste: bool,
    escape: Option<String>,
    queue: VecDeque<QueuedLine>,
    busy_until: Option<Instant>,
    last_status: i32,
    cwd: PathBuf,
    heredoc: Option<Heredoc>,
    blocks: Vec<bool>,
    next_script: u64,
    alive: bool,
}

impl Pane {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            history: Vec::new(),
            screen_top: 0,
            input: String::new(),
            in_paste: false,
            escape: None,
            queue: VecDeque::new(),
            busy_until: None,
            last_status: 0,
            cwd: std::env::temp_dir(),
            heredoc: None,
            blocks: Vec::new(),
            next_script: 0,
            alive: true,
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.busy_until.is_none() && self.heredoc.is_none()
    }

    /// Process keyboard input.
    fn feed(&mut self, text: &str, now: Instant) {
        for ch in text.chars() {
            if let Some(seq) = self.escape.as_mut() {
                seq.push(ch);
                match seq.as_str() {
                    "\x1b[200~" => {
                        self.in_paste = true;
                        self.escape = None;
                    }
                    "\x1b[201~" => {
                        self.in_paste = false;
                        self.escape = None;
                    }
                    s if escape_complete(s) => self.escape = None,
                    _ => {}
                }
                continue;
            }

            match ch {
                '\x1b' => self.escape = Some(ch.to_string()),
                '\r' | '\n' if self.in_paste => self.input.push('\n'),
                '\r' | '\n' => self.submit(),
                '\x03' => self.interrupt(),
                '\x0c' => self.clear(),
                '\x7f' | '\x08' => {
                    self.input.pop();
                }
                c => self.input.push(c),
            }
        }
        self.run_ready(now);
    }

    fn submit(&mut self) {
        let input = std::mem::take(&mut self.input);
        for (i, line) in input.split('\n').enumerate() {
            let prompt = if i == 0 { PROMPT } else { CONTINUATION_PROMPT };
            self.push_line(format!("{prompt}{line}"));
            self.queue.push_back(QueuedLine::typed(line));
        }
    }

    fn interrupt(&mut self) {
        let input = std::mem::take(&mut self.input);
        self.push_line(format!("{PROMPT}{input}^C"));
        self.queue.clear();
        self.busy_until = None;
        self.heredoc = None;
        self.blocks.clear();
        self.in_paste = false;
        self.last_status = 130;
    }

    fn clear(&mut self) {
        self.screen_top = self.history.len();
    }

    fn push_line(&mut self, line: String) {
        self.history.push(line);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
            self.screen_top = self.screen_top.saturating_sub(excess);
        }
    }

    fn print(&mut self, output: &str) {
        for line in output.split_inclusive('\n') {
            self.push_line(line.trim_end_matches('\n').to_string());
        }
    }

    /// Run queued lines until one blocks or the queue is empty.
    fn run_ready(&mut self, now: Instant) {
        let mut clock = now;
        while self.alive {
            if let Some(until) = self.busy_until {
                if now < until {
                    return;
                }
                clock = until;
                self.busy_until = None;
            }
            let Some(line) = self.queue.pop_front() else {
                return;
            };
            self.execute(line, clock);
        }
        self.queue.clear();
    }

    fn execute(&mut self, line: QueuedLine, clock: Instant) {
        if let Some(doc) = self.heredoc.as_mut() {
            let candidate = if doc.strip_tabs {
                line.text.trim_start_matches('\t')
            } else {
                line.text.as_str()
            };
            if candidate == doc.delimiter {
                if let Some(doc) = self.heredoc.take() {
                    if doc.print && !doc.body.is_empty() {
                        self.print(&format!("{}\n", doc.body.join("\n")));
                    }
                }
                self.last_status = 0;
            } else {
                doc.body.push(candidate.to_string());
            }
            return;
        }

        let trimmed = line.text.trim();
        if trimmed == "}" {
            self.blocks.pop();
            return;
        }
        if self.blocks.iter().any(|running| !running) {
            if opens_block(trimmed) {
                self.blocks.push(false);
            }
            return;
        }

        match line.guard {
            Some(Connector::And) if self.last_status != 0 => return,
            Some(Connector::Or) if self.last_status == 0 => return,
            _ => {}
        }

        if opens_block(trimmed) {
            let head = trimmed[..trimmed.len() - 1].trim_end();
            let condition = head.strip_suffix("&&").map(str::trim_end).unwrap_or(head);
            if !condition.is_empty() {
                self.run_list(condition, line.script, clock);
            }
            let run = self.last_status == 0;
            self.blocks.push(run);
            return;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            return;
        }
        self.run_list(trimmed, line.script, clock);
    }

    /// Run a `;`/`&&`/`||` list. Segments after a blocking command or a
    /// script invocation are re-queued behind it.
    fn run_list(&mut self, text: &str, script: Option<u64>, clock: Instant) {
        let mut segments = split_list(text).into_iter();
        while let Some((guard, segment)) = segments.next() {
            let skip = match guard {
                Some(Connector::And) => self.last_status != 0,
                Some(Connector::Or) => self.last_status == 0,
                _ => false,
            };
            let queued = self.queue.len();
            if !skip {
                self.run_command(&segment, script, clock);
            }

            // A script `exit` dropped the rest of its lines
            if !self.alive || self.queue.len() < queued {
                return;
            }
            let added = self.queue.len() - queued;
            if self.busy_until.is_some() || added > 0 {
                for (offset, (guard, segment)) in segments.enumerate() {
                    self.queue.insert(
                        added + offset,
                        QueuedLine {
                            text: segment,
                            script,
                            guard,
                        },
                    );
                }
                return;
            }
        }
    }

    fn run_command(&mut self, text: &str, script: Option<u64>, clock: Instant) {
        let words = match split_words(text, self.last_status) {
            Ok(words) => words,
            Err(message) => {
                self.print(&format!("sh: syntax error: {message}\n"));
                self.last_status = 2;
                return;
            }
        };
        let Some((name, args)) = words.split_first() else {
            return;
        };

        if let Some(heredoc) = heredoc_start(name, args) {
            self.heredoc = Some(heredoc);
            return;
        }

        self.last_status = match name.as_str() {
            "echo" => {
                let (newline, args) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                let mut out = args.join(" ");
                if newline {
                    out.push('\n');
                }
                self.print(&out);
                0
            }
            "printf" => match args.split_first() {
                Some((format, rest)) => {
                    self.print(&render_printf(format, rest));
                    0
                }
                None => {
                    self.print("printf: usage: printf format [arguments]\n");
                    2
                }
            },
            "true" | ":" => 0,
            "false" => 1,
            "pwd" => {
                let cwd = self.cwd.display().to_string();
                self.print(&format!("{cwd}\n"));
                0
            }
            "cd" => self.change_directory(args),
            "seq" => self.seq(args),
            "cat" => self.cat(args),
            "clear" => {
                self.clear();
                0
            }
            "sleep" => match args
                .first()
                .and_then(|s| s.parse::<f64>().ok())
                .and_then(|secs| sleep_deadline(clock, secs))
            {
                Some(until) => {
                    self.busy_until = Some(until);
                    0
                }
                _ => {
                    self.print("sleep: invalid time interval\n");
                    1
                }
            },
            "exit" => {
                let code = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(self.last_status);
                match script {
                    Some(id) => self.queue.retain(|q| q.script != Some(id)),
                    None => self.alive = false,
                }
                code
            }
            path if path.contains('/') => self.run_script(path),
            other => {
                self.print(&format!("sh: {other}: command not found\n"));
                127
            }
        };
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    fn change_directory(&mut self, args: &[String]) -> i32 {
        let target = match args.first().map(String::as_str) {
            Some("--") => args.get(1),
            _ => args.first(),
        };
        let Some(target) = target else {
            return 0;
        };
        let dir = self.resolve(target);
        if dir.is_dir() {
            self.cwd = dir;
            0
        } else {
            self.print(&format!("sh: cd: {target}: No such file or directory\n"));
            1
        }
    }

    fn seq(&mut self, args: &[String]) -> i32 {
        let numbers: Vec<i64> = args.iter().filter_map(|a| a.parse().ok()).collect();
        let (first, last) = match numbers.as_slice() {
            [last] if args.len() == 1 => (1, *last),
            [first, last] if args.len() == 2 => (*first, *last),
            _ => {
                self.print("seq: invalid arguments\n");
                return 1;
            }
        };
        if last.checked_sub(first).map_or(true, |span| span >= MAX_SEQ_SPAN) {
            self.print("seq: range too large\n");
            return 1;
        }
        let mut out = String::new();
        for n in first..=last {
            out.push_str(&n.to_string());
            out.push('\n');
        }
        self.print(&out);
        0
    }

    fn cat(&mut self, args: &[String]) -> i32 {
        let mut status = 0;
        for name in args {
            match std::fs::read_to_string(self.resolve(name)) {
                Ok(content) => self.print(&content),
                Err(_) => {
                    self.print(&format!("cat: {name}: No such file or directory\n"));
                    status = 1;
                }
            }
        }
        status
    }

    /// Run a script by path: its lines go to the front of the queue.
    fn run_script(&mut self, path: &str) -> i32 {
        let file = self.resolve(path);
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            Err(_) => {
                self.print(&format!("sh: {path}: No such file or directory\n"));
                return 127;
            }
        };

        // The generated scripts remove themselves on exit
        if content.contains("trap 'rm -f -- \"$0\"' EXIT") {
            if let Err(e) = std::fs::remove_file(&file) {
                warn!("Failed to remove script {}: {}", file.display(), e);
            }
        }

        let id = self.next_script;
        self.next_script += 1;
        let body: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, line)| !(*i == 0 && line.starts_with("#!")))
            .filter(|(_, line)| !line.trim_start().starts_with("trap "))
            .map(|(_, line)| line)
            .collect();
        for line in body.into_iter().rev() {
            self.queue.push_front(QueuedLine {
                text: line.to_string(),
                script: Some(id),
                guard: None,
            });
        }
        0
    }

    fn render(&self, rows: usize, scrollback: Option<usize>) -> String {
        let mut lines: Vec<&str> = self.history.iter().map(String::as_str).collect();
        let prompt_line;
        if self.is_idle() {
            prompt_line = format!("{PROMPT}{}", self.input);
            lines.push(&prompt_line);
        } else if !self.input.is_empty() {
            lines.push(&self.input);
        }

        let visible_start = self
            .screen_top
            .min(lines.len())
            .max(lines.len().saturating_sub(rows));
        let start = match scrollback {
            Some(depth) => visible_start.saturating_sub(depth),
            None => visible_start,
        };
        trim_trailing_blank_lines(&lines[start..].join("\n"))
    }
}

/// When a `sleep` started at `clock` ends. Very long sleeps are capped.
fn sleep_deadline(clock: Instant, secs: f64) -> Option<Instant> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let duration = Duration::try_from_secs_f64(secs.min(MAX_SLEEP.as_secs_f64())).ok()?;
    clock.checked_add(duration)
}

fn opens_block(line: &str) -> bool {
    line == "{" || line.ends_with(" {")
}

fn escape_complete(seq: &str) -> bool {
    let mut chars = seq.chars().skip(1);
    match chars.next() {
        None => false,
        Some('[') | Some('O') => seq
            .chars()
            .skip(2)
            .last()
            .is_some_and(|c| ('\x40'..='\x7e').contains(&c)),
        Some(_) => true,
    }
}

fn heredoc_start(name: &str, args: &[String]) -> Option<Heredoc> {
    let pos = args
        .iter()
        .position(|a| a.starts_with("<<") && !a.starts_with("<<<"))?;
    let word = &args[pos];
    let (strip_tabs, inline) = match word.strip_prefix("<<-") {
        Some(rest) => (true, rest),
        None => (false, &word[2..]),
    };
    let delimiter = if inline.is_empty() {
        args.get(pos + 1)?.clone()
    } else {
        inline.to_string()
    };
    Some(Heredoc {
        delimiter,
        strip_tabs,
        print: name == "cat",
        body: Vec::new(),
    })
}

/// Split a command line on unquoted `;`, `&&` and `||`.
fn split_list(text: &str) -> Vec<(Option<Connector>, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut guard = None;
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), '\\') | (None, '\\') => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';') => {
                segments.push((guard, std::mem::take(&mut current)));
                guard = Some(Connector::Then);
            }
            (None, '&') if chars.peek() == Some(&'&') => {
                chars.next();
                segments.push((guard, std::mem::take(&mut current)));
                guard = Some(Connector::And);
            }
            (None, '|') if chars.peek() == Some(&'|') => {
                chars.next();
                segments.push((guard, std::mem::take(&mut current)));
                guard = Some(Connector::Or);
            }
            (None, c) => current.push(c),
        }
    }
    segments.push((guard, current));

    segments
        .into_iter()
        .map(|(guard, segment)| (guard, segment.trim().to_string()))
        .filter(|(_, segment)| !segment.is_empty())
        .collect()
}

/// Shell-style word splitting with quotes, backslashes and `$?`.
fn split_words(text: &str, last_status: i32) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated quoted string".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek() {
                            Some(&next) if matches!(next, '"' | '\\' | '$' | '`') => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        Some('$') => expand(&mut chars, &mut current, last_status),
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated quoted string".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '$' => {
                in_word = true;
                expand(&mut chars, &mut current, last_status);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Expand a `$` reference. Only `$?` is known; other names expand empty.
fn expand(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
    last_status: i32,
) {
    match chars.peek() {
        Some('?') => {
            chars.next();
            out.push_str(&last_status.to_string());
        }
        Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
            while chars
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
            {
                chars.next();
            }
        }
        _ => out.push('$'),
    }
}

/// `printf` with `%s`, `%d`, `%%` and backslash escapes. The format is
/// reused while arguments remain.
fn render_printf(format: &str, args: &[String]) -> String {
    let mut out = String::new();
    let mut args = args.iter();

    loop {
        let mut consumed = false;
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                },
                '%' => match chars.next() {
                    Some('%') => out.push('%'),
                    Some('s') => {
                        consumed = true;
                        if let Some(arg) = args.next() {
                            out.push_str(arg);
                        }
                    }
                    Some('d') => {
                        consumed = true;
                        let value = args.next().and_then(|a| a.parse::<i64>().ok());
                        out.push_str(&value.unwrap_or(0).to_string());
                    }
                    Some(other) => {
                        out.push('%');
                        out.push(other);
                    }
                    None => out.push('%'),
                },
                c => out.push(c),
            }
        }
        if !consumed || args.len() == 0 {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(host: &MemoryHost) -> (Arc<dyn HostConnection>, SessionHandle) {
        let conn = host.connect().await.unwrap();
        let handle = conn.current_session().await.unwrap();
        (conn, handle)
    }

    async fn screen(conn: &Arc<dyn HostConnection>, handle: &SessionHandle) -> String {
        conn.get_screen_contents(handle, true).await.unwrap()
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"echo 'a b' "c $?" d\ e"#, 3).unwrap(),
            vec!["echo", "a b", "c 3", "d e"]
        );
        assert_eq!(split_words("printf '%s_%s\\n' X Y", 0).unwrap()[1], "%s_%s\\n");
        assert!(split_words("echo 'open", 0).is_err());
        assert_eq!(split_words("echo $HOME!", 0).unwrap(), vec!["echo", "!"]);
    }

    #[test]
    fn test_split_list() {
        let segments = split_list("true && echo 'a;b' || echo c; echo d");
        assert_eq!(
            segments,
            vec![
                (None, "true".to_string()),
                (Some(Connector::And), "echo 'a;b'".to_string()),
                (Some(Connector::Or), "echo c".to_string()),
                (Some(Connector::Then), "echo d".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_printf() {
        let args = vec!["PANE_MCP_END".to_string(), "abc".to_string(), "0".to_string()];
        assert_eq!(render_printf("%s_%s:%s\\n", &args), "PANE_MCP_END_abc:0\n");
        assert_eq!(
            render_printf("%s\\n", &["a".to_string(), "b".to_string()]),
            "a\nb\n"
        );
        assert_eq!(render_printf("100%%\\n", &[]), "100%\n");
    }

    #[test]
    fn test_escape_complete() {
        assert!(!escape_complete("\x1b"));
        assert!(!escape_complete("\x1b["));
        assert!(!escape_complete("\x1b[20"));
        assert!(escape_complete("\x1b[A"));
        assert!(escape_complete("\x1bb"));
    }

    #[tokio::test]
    async fn test_echo_is_echoed_and_printed() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "echo hello world\n").await.unwrap();

        let screen = screen(&conn, &handle).await;
        assert_eq!(screen, "$ echo hello world\nhello world\n$ ");
        assert_eq!(host.last_status("%0").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "frobnicate --all\n").await.unwrap();

        assert!(screen(&conn, &handle)
            .await
            .contains("sh: frobnicate: command not found"));
        assert_eq!(host.last_status("%0").unwrap(), 127);
    }

    #[tokio::test]
    async fn test_status_lists() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "false && echo no || echo yes; printf '%s\\n' \"$?\"\n")
            .await
            .unwrap();

        let history = host.history("%0").unwrap();
        assert_eq!(&history[1..], &["yes", "0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_defers_queued_input() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "sleep 5\necho done\n").await.unwrap();
        assert!(!host.history("%0").unwrap().contains(&"done".to_string()));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!screen(&conn, &handle).await.ends_with("done\n$ "));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(screen(&conn, &handle).await.ends_with("done\n$ "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_inside_list_defers_rest() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "sleep 1 && echo after\n").await.unwrap();
        assert_eq!(host.history("%0").unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(screen(&conn, &handle).await.contains("\nafter\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cancels_running_command() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "sleep 100\necho never\n").await.unwrap();
        conn.send_text(&handle, "\x03").await.unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        let screen = screen(&conn, &handle).await;
        assert!(!screen.contains("\nnever"));
        assert!(screen.ends_with("^C\n$ "));
        assert_eq!(host.last_status("%0").unwrap(), 130);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_sleep_is_capped_and_interruptible() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "sleep 1e30\necho never\n").await.unwrap();
        tokio::time::advance(Duration::from_secs(86400)).await;
        assert!(!screen(&conn, &handle).await.contains("\nnever"));

        conn.send_text(&handle, "\x03").await.unwrap();
        assert_eq!(host.last_status("%0").unwrap(), 130);

        conn.send_text(&handle, "sleep nan\n").await.unwrap();
        assert_eq!(host.last_status("%0").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_seq_range_is_bounded() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "seq 1 9000000000000000000\n")
            .await
            .unwrap();
        assert_eq!(host.last_status("%0").unwrap(), 1);
        assert!(screen(&conn, &handle)
            .await
            .contains("seq: range too large"));

        conn.send_text(&handle, "seq -9000000000000000000 9000000000000000000\n")
            .await
            .unwrap();
        assert_eq!(host.last_status("%0").unwrap(), 1);

        conn.send_text(&handle, "seq 3 1\n").await.unwrap();
        assert_eq!(host.last_status("%0").unwrap(), 0);
    }

    #[test]
    fn test_sleep_deadline() {
        let now = Instant::now();
        assert_eq!(sleep_deadline(now, 1.5), Some(now + Duration::from_millis(1500)));
        assert_eq!(sleep_deadline(now, 1e30), Some(now + MAX_SLEEP));
        assert_eq!(sleep_deadline(now, -1.0), None);
        assert_eq!(sleep_deadline(now, f64::INFINITY), None);
        assert_eq!(sleep_deadline(now, f64::NAN), None);
    }

    #[tokio::test]
    async fn test_bracketed_paste_runs_on_enter() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "\x1b[200~echo one\necho two\x1b[201~")
            .await
            .unwrap();
        assert!(screen(&conn, &handle).await.ends_with("$ echo one\necho two"));

        conn.send_text(&handle, "\r").await.unwrap();
        assert_eq!(
            host.history("%0").unwrap(),
            vec!["$ echo one", "> echo two", "one", "two"]
        );
    }

    #[tokio::test]
    async fn test_inject_text_waits_for_enter() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.inject_text(&handle, "echo 'tab\there'").await.unwrap();
        assert!(host.history("%0").unwrap().is_empty());

        conn.send_text(&handle, "\r").await.unwrap();
        assert_eq!(host.history("%0").unwrap()[1], "tab\there");
    }

    #[tokio::test]
    async fn test_block_skipped_when_condition_fails() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(
            &handle,
            "\x1b[200~cd -- '/definitely/not/here' && {\necho inside\n}\nprintf '%s\\n' \"$?\"\x1b[201~\r",
        )
        .await
        .unwrap();

        let history = host.history("%0").unwrap();
        assert!(!history.contains(&"inside".to_string()));
        assert_eq!(history.last().map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_cd_block_runs_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        let text = format!(
            "\x1b[200~cd -- '{}' && {{\npwd\n}}\x1b[201~\r",
            dir.path().display()
        );
        conn.send_text(&handle, &text).await.unwrap();

        let history = host.history("%0").unwrap();
        assert_eq!(history.last(), Some(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_script_file_runs_and_removes_itself() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pane-mcp-test.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ntrap 'rm -f -- \"$0\"' EXIT\ncat <<'EOF'\nline one\n  line two\nEOF\nexit 3\necho unreachable\n",
        )
        .unwrap();

        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;
        conn.send_text(&handle, &format!("'{}'\n", script.display()))
            .await
            .unwrap();

        let history = host.history("%0").unwrap();
        assert_eq!(&history[1..], &["line one", "  line two"]);
        assert_eq!(host.last_status("%0").unwrap(), 3);
        assert!(!script.exists());
    }

    #[tokio::test]
    async fn test_clear_keeps_scrollback() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "echo before\n").await.unwrap();
        conn.send_text(&handle, "\x0c").await.unwrap();

        assert_eq!(
            conn.get_screen_contents(&handle, false).await.unwrap(),
            "$ "
        );
        assert!(screen(&conn, &handle).await.contains("before"));
    }

    #[tokio::test]
    async fn test_visible_screen_is_bounded() {
        let host = MemoryHost::with_scrollback(5);
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "seq 100\n").await.unwrap();

        let visible = conn.get_screen_contents(&handle, false).await.unwrap();
        assert_eq!(visible.lines().count(), DEFAULT_ROWS);
        assert!(visible.ends_with("100\n$ "));

        let full = screen(&conn, &handle).await;
        assert_eq!(full.lines().count(), DEFAULT_ROWS + 5);
    }

    #[tokio::test]
    async fn test_closed_pane_is_not_found() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        assert!(host.close_pane("%0"));
        assert!(matches!(
            conn.send_text(&handle, "ls\n").await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            conn.resolve_session("%0").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_kills_interactive_pane() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        conn.send_text(&handle, "exit\n").await.unwrap();
        assert!(conn.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let host = MemoryHost::new();
        host.set_reachable(false);

        assert!(matches!(host.connect().await, Err(Error::Connection(_))));
        assert_eq!(host.connect_count(), 1);

        host.set_reachable(true);
        let (conn, _) = connect(&host).await;
        host.set_reachable(false);
        assert!(matches!(conn.probe().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_failing_probes() {
        let host = MemoryHost::new();
        let (conn, _) = connect(&host).await;

        host.fail_probes(1);
        assert!(conn.probe().await.is_err());
        assert!(conn.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_connection() {
        let host = MemoryHost::new();
        let (conn, _) = connect(&host).await;

        conn.close().await;
        assert!(matches!(conn.probe().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_create_tab_and_session() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        let tab = conn.create_tab(Some(&handle)).await.unwrap();
        assert_eq!(tab.session_id, "%1");
        assert_eq!(tab.tab_id, "@1");
        assert_eq!(tab.window_id, "$0");

        let split = conn.create_session(&tab).await.unwrap();
        assert_eq!(split.session_id, "%2");
        assert_eq!(split.tab_id, "@1");

        assert_eq!(conn.current_session().await.unwrap(), split);
        assert_eq!(conn.list_sessions().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_print_from_background() {
        let host = MemoryHost::new();
        let (conn, handle) = connect(&host).await;

        host.print("%0", "job finished\n").unwrap();
        assert!(screen(&conn, &handle).await.starts_with("job finished"));
        assert!(host.print("%9", "x").is_err());
    }
}
