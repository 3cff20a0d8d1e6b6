//! Delivery strategies: how text gets into a session.
//!
//! Delivery never waits for the command to finish. Failures are reported as
//! `Error::Delivery` (or `Error::Connection` when the host itself is gone)
//! and are not retried.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pane_mcp_core::{Error, ExecutionStrategy, HostSettings, Result, SessionHandle};
use pane_mcp_host::HostConnection;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classify::{classify_with, StrategyExt};

const PASTE_START: &str = "\x1b[200~";
const PASTE_END: &str = "\x1b[201~";

/// One way of placing text into a session.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// The strategy this delivery implements.
    fn strategy(&self) -> ExecutionStrategy;

    /// Deliver `text` to the session and submit it.
    async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<()>;
}

/// Literal text plus a newline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDelivery;

#[async_trait]
impl Delivery for DirectDelivery {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Direct
    }

    async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<()> {
        let text = text.trim_end_matches('\n');
        if !self.strategy().permits(text) {
            return Err(Error::Delivery(
                "direct delivery cannot carry multi-line or heredoc text".to_string(),
            ));
        }
        conn.send_text(handle, &format!("{text}\n"))
            .await
            .map_err(delivery_error)
    }
}

/// Text written to an executable script that removes itself when it exits.
#[derive(Debug, Clone)]
pub struct ScriptFileDelivery {
    script_dir: PathBuf,
    interpreter: String,
}

impl ScriptFileDelivery {
    /// Create a delivery writing scripts to `script_dir`.
    pub fn new(script_dir: impl Into<PathBuf>, interpreter: impl Into<String>) -> Self {
        Self {
            script_dir: script_dir.into(),
            interpreter: interpreter.into(),
        }
    }

    /// Script body: shebang, self-removal trap, then the text verbatim.
    pub fn script_contents(&self, text: &str) -> String {
        let mut script = format!("#!{}\ntrap 'rm -f -- \"$0\"' EXIT\n{}", self.interpreter, text);
        if !script.ends_with('\n') {
            script.push('\n');
        }
        script
    }

    async fn write_script(&self, text: &str) -> Result<PathBuf> {
        let path = self
            .script_dir
            .join(format!("pane-mcp-{}.sh", Uuid::new_v4().simple()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o700);

        let mut file = options.open(&path).await.map_err(|e| {
            Error::Delivery(format!("Failed to create script {}: {e}", path.display()))
        })?;
        file.write_all(self.script_contents(text).as_bytes())
            .await
            .map_err(|e| Error::Delivery(format!("Failed to write script {}: {e}", path.display())))?;
        file.flush().await?;

        Ok(path)
    }
}

#[async_trait]
impl Delivery for ScriptFileDelivery {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::ScriptFile
    }

    async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<()> {
        let path = self.write_script(text).await?;
        debug!("Wrote {} bytes to script {}", text.len(), path.display());

        let invocation = format!("{}\n", shell_quote(&path.to_string_lossy()));
        if let Err(e) = conn.send_text(handle, &invocation).await {
            remove_script(&path).await;
            return Err(delivery_error(e));
        }
        Ok(())
    }
}

async fn remove_script(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove script {}: {}", path.display(), e);
    }
}

/// The host's out-of-band input buffer, then Enter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextInjectionDelivery;

#[async_trait]
impl Delivery for TextInjectionDelivery {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::TextInjection
    }

    async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<()> {
        conn.inject_text(handle, text.trim_end_matches('\n'))
            .await
            .map_err(delivery_error)?;
        conn.send_text(handle, "\r").await.map_err(delivery_error)
    }
}

/// Bracketed-paste markers around the text, then Enter.
#[derive(Debug, Clone, Copy, Default)]
pub struct BracketedPasteDelivery;

#[async_trait]
impl Delivery for BracketedPasteDelivery {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::BracketedPaste
    }

    async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<()> {
        if !self.strategy().permits(text) {
            return Err(Error::Delivery(
                "bracketed paste cannot carry escape characters".to_string(),
            ));
        }
        let payload = format!(
            "{PASTE_START}{}{PASTE_END}\r",
            text.trim_end_matches('\n')
        );
        conn.send_text(handle, &payload).await.map_err(delivery_error)
    }
}

/// All four strategies plus the classifier default.
#[derive(Debug, Clone)]
pub struct Deliveries {
    direct: DirectDelivery,
    script_file: ScriptFileDelivery,
    text_injection: TextInjectionDelivery,
    bracketed_paste: BracketedPasteDelivery,
    ambiguous: ExecutionStrategy,
}

impl Deliveries {
    /// Build the strategy set from host settings.
    pub fn new(host: &HostSettings, ambiguous: ExecutionStrategy) -> Self {
        Self {
            direct: DirectDelivery,
            script_file: ScriptFileDelivery::new(host.script_dir(), host.script_interpreter.clone()),
            text_injection: TextInjectionDelivery,
            bracketed_paste: BracketedPasteDelivery,
            ambiguous,
        }
    }

    /// Strategy the classifier picks for `text`.
    pub fn classify(&self, text: &str) -> ExecutionStrategy {
        classify_with(text, self.ambiguous)
    }

    /// The delivery implementing `strategy`.
    pub fn select(&self, strategy: ExecutionStrategy) -> &dyn Delivery {
        match strategy {
            ExecutionStrategy::Direct => &self.direct,
            ExecutionStrategy::ScriptFile => &self.script_file,
            ExecutionStrategy::TextInjection => &self.text_injection,
            ExecutionStrategy::BracketedPaste => &self.bracketed_paste,
        }
    }

    /// Classify `text`, deliver it, and report the strategy used.
    pub async fn deliver(
        &self,
        conn: &dyn HostConnection,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<ExecutionStrategy> {
        let strategy = self.classify(text);
        debug!("Delivering {} bytes to {} via {}", text.len(), handle.session_id, strategy);
        self.select(strategy).deliver(conn, handle, text).await?;
        Ok(strategy)
    }
}

/// Quote a word for POSIX shells.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Host failures while writing become delivery failures, unless the host is
/// unreachable altogether.
fn delivery_error(err: Error) -> Error {
    match err {
        Error::Connection(_) | Error::Delivery(_) => err,
        Error::SessionNotFound(id) => Error::Delivery(format!("session {id} is gone")),
        other => Error::Delivery(other.to_string()),
    }
}
