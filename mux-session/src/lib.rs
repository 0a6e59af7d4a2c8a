//! Detachable terminal session transport for interactive CLI automation.
//!
//! `mux-session` abstracts a detached, input-addressable terminal session
//! running one interactive program. Higher layers (controllers, orchestrators)
//! drive sessions exclusively through the [`SessionBackend`] trait, so the
//! concrete transport (tmux today, other multiplexers or PTYs tomorrow) stays
//! swappable while readiness heuristics, queueing, and health logic live
//! above this crate.
//!
//! The transport never retries on its own; callers layer retry policies on
//! top of these primitives.

pub mod stub;
pub mod tmux;

pub use stub::{ScriptedBackend, SentItem};
pub use tmux::TmuxBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Maximum number of characters injected per transport round-trip.
///
/// Longer payloads are split into chunks of this size; several multiplexer
/// builds silently truncate oversized `send-keys` argument vectors.
pub const SEND_CHUNK_SIZE: usize = 100;

/// Declarative description of a session handed to a backend at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Logical identifier for the session.
    pub name: String,
    /// Executable to launch inside the session (e.g. "claude", "gemini").
    pub executable: String,
    /// Working directory for the spawned process.
    pub working_dir: PathBuf,
    /// Extra arguments appended after the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides applied when spawning the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Pane width, when the backend supports geometry control.
    #[serde(default)]
    pub pane_width: Option<u16>,
    /// Pane height, when the backend supports geometry control.
    #[serde(default)]
    pub pane_height: Option<u16>,
}

impl SessionSpec {
    /// Create a spec with the given name and executable, working in `dir`.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            working_dir: dir.into(),
            args: Vec::new(),
            env: HashMap::new(),
            pane_width: None,
            pane_height: None,
        }
    }

    /// Append extra executable arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set pane geometry.
    pub fn with_geometry(mut self, width: u16, height: u16) -> Self {
        self.pane_width = Some(width);
        self.pane_height = Some(height);
        self
    }

    /// Validate the session name against multiplexer naming rules.
    pub fn validate_name(&self) -> Result<(), SessionError> {
        if self.name.is_empty() {
            return Err(SessionError::InvalidName(
                "session name cannot be empty".to_string(),
            ));
        }
        if self.name.contains(':') || self.name.contains('.') {
            return Err(SessionError::InvalidName(format!(
                "session name '{}' cannot contain ':' or '.' characters",
                self.name
            )));
        }
        Ok(())
    }
}

/// Transport-level failures reported by session backends.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid session name: {0}")]
    InvalidName(String),

    #[error("terminal multiplexer not found or not installed")]
    MultiplexerNotFound,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport interface for one detachable interactive session.
///
/// Concrete implementations encapsulate the process-management mechanics
/// while controllers above focus on readiness heuristics, command
/// scheduling, and health checks. Every operation targeting a missing
/// session fails with [`SessionError::NotFound`]; generic transport
/// failures surface as [`SessionError::Backend`]. None of the operations
/// retry internally.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// The immutable spec this backend was created with.
    fn spec(&self) -> &SessionSpec;

    /// Launch the configured executable in a new detached session.
    ///
    /// Fails with [`SessionError::AlreadyExists`] when a session with the
    /// spec name is already running.
    async fn start(&self) -> Result<(), SessionError>;

    /// Whether the session currently exists and is reachable.
    async fn session_exists(&self) -> bool;

    /// Terminate the session.
    async fn kill(&self) -> Result<(), SessionError>;

    /// Inject literal text into the input buffer without submitting.
    ///
    /// Implementations must split `text` into chunks of at most
    /// [`SEND_CHUNK_SIZE`] characters and deliver them in literal mode so
    /// punctuation is preserved verbatim.
    async fn send_text(&self, text: &str) -> Result<(), SessionError>;

    /// Send the Enter key.
    async fn send_enter(&self) -> Result<(), SessionError>;

    /// Send a named key (e.g. `Enter`, `C-m`, `M-Enter`).
    async fn send_key(&self, key: &str) -> Result<(), SessionError>;

    /// Interrupt the current operation (Ctrl+C equivalent).
    async fn send_ctrl_c(&self) -> Result<(), SessionError>;

    /// Capture text from the visible pane.
    ///
    /// `start_line` selects a backend-specific starting offset (for tmux,
    /// 0 is the top of the buffer and negative values reach into history);
    /// `lines` bounds the capture to the trailing N lines when no start is
    /// given. With neither, the currently visible pane is returned.
    async fn capture_output(
        &self,
        start_line: Option<i64>,
        lines: Option<u32>,
    ) -> Result<String, SessionError>;

    /// Capture the entire pane history.
    async fn capture_scrollback(&self) -> Result<String, SessionError>;

    /// Enumerate currently attached interactive clients.
    ///
    /// Used by controllers for manual-takeover detection: a non-empty list
    /// means a human terminal is connected to the session.
    async fn list_clients(&self) -> Result<Vec<String>, SessionError>;

    /// Attach the calling terminal to the session, blocking until the
    /// human detaches. `read_only` prevents accidental input when the
    /// backend supports it.
    async fn attach(&self, read_only: bool) -> Result<(), SessionError>;
}

#[async_trait]
impl<T: SessionBackend + ?Sized> SessionBackend for std::sync::Arc<T> {
    fn spec(&self) -> &SessionSpec {
        (**self).spec()
    }
    async fn start(&self) -> Result<(), SessionError> {
        (**self).start().await
    }
    async fn session_exists(&self) -> bool {
        (**self).session_exists().await
    }
    async fn kill(&self) -> Result<(), SessionError> {
        (**self).kill().await
    }
    async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        (**self).send_text(text).await
    }
    async fn send_enter(&self) -> Result<(), SessionError> {
        (**self).send_enter().await
    }
    async fn send_key(&self, key: &str) -> Result<(), SessionError> {
        (**self).send_key(key).await
    }
    async fn send_ctrl_c(&self) -> Result<(), SessionError> {
        (**self).send_ctrl_c().await
    }
    async fn capture_output(
        &self,
        start_line: Option<i64>,
        lines: Option<u32>,
    ) -> Result<String, SessionError> {
        (**self).capture_output(start_line, lines).await
    }
    async fn capture_scrollback(&self) -> Result<String, SessionError> {
        (**self).capture_scrollback().await
    }
    async fn list_clients(&self) -> Result<Vec<String>, SessionError> {
        (**self).list_clients().await
    }
    async fn attach(&self, read_only: bool) -> Result<(), SessionError> {
        (**self).attach(read_only).await
    }
}

/// Split `text` into chunks of at most [`SEND_CHUNK_SIZE`] characters,
/// respecting character boundaries.
pub fn chunk_text(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == SEND_CHUNK_SIZE {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    chunks.push(&text[start..]);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_name_validation() {
        assert!(SessionSpec::new("crew-claude", "claude", "/tmp")
            .validate_name()
            .is_ok());
        assert!(SessionSpec::new("agent_1", "claude", "/tmp")
            .validate_name()
            .is_ok());

        assert!(SessionSpec::new("", "claude", "/tmp")
            .validate_name()
            .is_err());
        assert!(SessionSpec::new("bad:name", "claude", "/tmp")
            .validate_name()
            .is_err());
        assert!(SessionSpec::new("bad.name", "claude", "/tmp")
            .validate_name()
            .is_err());
    }

    #[test]
    fn test_chunk_text_boundaries() {
        assert!(chunk_text("").is_empty());

        let short = "hello";
        assert_eq!(chunk_text(short), vec!["hello"]);

        let exact = "x".repeat(SEND_CHUNK_SIZE);
        assert_eq!(chunk_text(&exact), vec![exact.as_str()]);

        let long = "y".repeat(SEND_CHUNK_SIZE * 2 + 5);
        let chunks = chunk_text(&long);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), SEND_CHUNK_SIZE);
        assert_eq!(chunks[1].len(), SEND_CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 5);
        assert_eq!(chunks.concat(), long);
    }

    #[test]
    fn test_chunk_text_multibyte() {
        let text = "é".repeat(SEND_CHUNK_SIZE + 1);
        let chunks = chunk_text(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_spec_builder() {
        let spec = SessionSpec::new("s", "qwen", "/work")
            .with_args(["--yolo"])
            .with_geometry(220, 50);
        assert_eq!(spec.args, vec!["--yolo"]);
        assert_eq!(spec.pane_width, Some(220));
        assert_eq!(spec.pane_height, Some(50));
    }
}
