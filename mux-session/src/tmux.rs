//! tmux(1) transport for detachable sessions.
//!
//! Shells out to the `tmux` binary via `tokio::process`, one subcommand per
//! primitive. Text injection uses literal mode (`send-keys -l`) in chunks so
//! punctuation and option-looking strings survive the trip; submit keys go
//! through the named-key path instead.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::{chunk_text, SessionBackend, SessionError, SessionSpec};

/// Session backend driving a detached tmux session.
pub struct TmuxBackend {
    spec: SessionSpec,
}

impl TmuxBackend {
    /// Create a backend for `spec`. Fails when tmux is not installed.
    pub async fn new(spec: SessionSpec) -> Result<Self, SessionError> {
        spec.validate_name()?;

        let probe = Command::new("tmux")
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|_| SessionError::MultiplexerNotFound)?;
        if !probe.success() {
            return Err(SessionError::MultiplexerNotFound);
        }

        Ok(Self { spec })
    }

    /// Run a tmux subcommand, discarding stdout.
    async fn run(&self, args: &[&str]) -> Result<(), SessionError> {
        self.run_with_output(args).await.map(|_| ())
    }

    /// Run a tmux subcommand and capture stdout.
    async fn run_with_output(&self, args: &[&str]) -> Result<String, SessionError> {
        debug!(session = %self.spec.name, ?args, "tmux");
        let output = Command::new("tmux").args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(self.classify_failure(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn classify_failure(&self, stderr: String) -> SessionError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("can't find session")
            || lowered.contains("session not found")
            || lowered.contains("no server running")
        {
            SessionError::NotFound(self.spec.name.clone())
        } else if lowered.contains("duplicate session") {
            SessionError::AlreadyExists(self.spec.name.clone())
        } else {
            SessionError::Backend(stderr)
        }
    }

    /// Guard shared by every session-targeting primitive.
    async fn ensure_exists(&self) -> Result<(), SessionError> {
        if !self.session_exists().await {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    async fn start(&self) -> Result<(), SessionError> {
        if self.session_exists().await {
            return Err(SessionError::AlreadyExists(self.spec.name.clone()));
        }

        let working_dir = self.spec.working_dir.to_string_lossy().to_string();
        let width = self.spec.pane_width.map(|w| w.to_string());
        let height = self.spec.pane_height.map(|h| h.to_string());

        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            &self.spec.name,
            "-c",
            &working_dir,
        ];
        if let Some(w) = width.as_deref() {
            args.extend_from_slice(&["-x", w]);
        }
        if let Some(h) = height.as_deref() {
            args.extend_from_slice(&["-y", h]);
        }

        let env_pairs: Vec<String> = self
            .spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        for pair in &env_pairs {
            args.extend_from_slice(&["-e", pair]);
        }

        args.push(&self.spec.executable);
        for arg in &self.spec.args {
            args.push(arg);
        }

        self.run(&args).await
    }

    async fn session_exists(&self) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", &self.spec.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn kill(&self) -> Result<(), SessionError> {
        self.ensure_exists().await?;
        self.run(&["kill-session", "-t", &self.spec.name]).await
    }

    async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.ensure_exists().await?;
        for chunk in chunk_text(text) {
            self.run(&["send-keys", "-t", &self.spec.name, "-l", "--", chunk])
                .await?;
        }
        Ok(())
    }

    async fn send_enter(&self) -> Result<(), SessionError> {
        self.send_key("Enter").await
    }

    async fn send_key(&self, key: &str) -> Result<(), SessionError> {
        self.ensure_exists().await?;
        self.run(&["send-keys", "-t", &self.spec.name, key]).await
    }

    async fn send_ctrl_c(&self) -> Result<(), SessionError> {
        self.send_key("C-c").await
    }

    async fn capture_output(
        &self,
        start_line: Option<i64>,
        lines: Option<u32>,
    ) -> Result<String, SessionError> {
        self.ensure_exists().await?;

        let mut args: Vec<String> = vec![
            "capture-pane".to_string(),
            "-t".to_string(),
            self.spec.name.clone(),
            "-p".to_string(),
        ];
        match (start_line, lines) {
            (Some(start), _) => {
                args.push("-S".to_string());
                args.push(start.to_string());
            }
            (None, Some(n)) => {
                args.push("-S".to_string());
                args.push(format!("-{}", n));
            }
            (None, None) => {}
        }

        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_with_output(&borrowed).await
    }

    async fn capture_scrollback(&self) -> Result<String, SessionError> {
        self.ensure_exists().await?;
        self.run_with_output(&["capture-pane", "-t", &self.spec.name, "-p", "-S", "-"])
            .await
    }

    async fn list_clients(&self) -> Result<Vec<String>, SessionError> {
        self.ensure_exists().await?;
        let output = self
            .run_with_output(&[
                "list-clients",
                "-t",
                &self.spec.name,
                "-F",
                "#{client_tty}",
            ])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn attach(&self, read_only: bool) -> Result<(), SessionError> {
        self.ensure_exists().await?;

        let mut args = vec!["attach-session", "-t", self.spec.name.as_str()];
        if read_only {
            args.push("-r");
        }

        // Inherits the caller's terminal and blocks until detach.
        let status = Command::new("tmux")
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(SessionError::Backend(format!(
                "attach-session exited with {}",
                status
            )));
        }
        Ok(())
    }
}
