//! Scripted in-memory backend for tests and dry runs.
//!
//! `ScriptedBackend` replays pre-loaded pane captures, scrollback frames,
//! and client lists, while recording every keystroke a controller sends.
//! Frames are consumed in order; the last frame keeps repeating, which lets
//! readiness loops observe a stable pane without scripting dozens of
//! identical captures.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{SessionBackend, SessionError, SessionSpec};

/// One recorded input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Text(String),
    Key(String),
    Enter,
    CtrlC,
}

#[derive(Default)]
struct ScriptState {
    exists: bool,
    start_count: u32,
    kill_count: u32,
    captures: VecDeque<String>,
    last_capture: String,
    scrollbacks: VecDeque<String>,
    last_scrollback: String,
    client_frames: VecDeque<Vec<String>>,
    current_clients: Vec<String>,
    sent: Vec<SentItem>,
    failing_sends: u32,
    fail_start: bool,
}

/// In-memory [`SessionBackend`] driven by scripted frames.
pub struct ScriptedBackend {
    spec: SessionSpec,
    state: Mutex<ScriptState>,
}

impl ScriptedBackend {
    /// Create a stub backend that reports an already-running session.
    pub fn running(spec: SessionSpec) -> Self {
        let backend = Self::stopped(spec);
        backend.state.lock().unwrap().exists = true;
        backend
    }

    /// Create a stub backend with no session yet.
    pub fn stopped(spec: SessionSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Queue a visible-pane frame. The last queued frame repeats forever.
    pub fn push_capture(&self, frame: impl Into<String>) {
        self.state.lock().unwrap().captures.push_back(frame.into());
    }

    /// Queue a scrollback frame. The last queued frame repeats forever.
    pub fn push_scrollback(&self, frame: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .scrollbacks
            .push_back(frame.into());
    }

    /// Queue an attached-clients observation. The last one repeats forever.
    pub fn push_clients(&self, clients: Vec<String>) {
        self.state.lock().unwrap().client_frames.push_back(clients);
    }

    /// Make the next `n` input operations fail with a transport error.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().unwrap().failing_sends = n;
    }

    /// Make the next `start()` fail with a transport error.
    pub fn fail_next_start(&self) {
        self.state.lock().unwrap().fail_start = true;
    }

    /// Flip session existence directly (e.g. to simulate a crash).
    pub fn set_exists(&self, exists: bool) {
        self.state.lock().unwrap().exists = exists;
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SentItem> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Concatenation of all literal text sent so far.
    pub fn sent_text(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|item| match item {
                SentItem::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of `start()` calls observed.
    pub fn start_count(&self) -> u32 {
        self.state.lock().unwrap().start_count
    }

    /// Number of `kill()` calls observed.
    pub fn kill_count(&self) -> u32 {
        self.state.lock().unwrap().kill_count
    }

    fn record_send(&self, item: SentItem) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(SessionError::Backend("scripted send failure".to_string()));
        }
        state.sent.push(item);
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    async fn start(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.exists {
            return Err(SessionError::AlreadyExists(self.spec.name.clone()));
        }
        if state.fail_start {
            state.fail_start = false;
            return Err(SessionError::Backend("scripted start failure".to_string()));
        }
        state.exists = true;
        state.start_count += 1;
        Ok(())
    }

    async fn session_exists(&self) -> bool {
        self.state.lock().unwrap().exists
    }

    async fn kill(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        state.exists = false;
        state.kill_count += 1;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.record_send(SentItem::Text(text.to_string()))
    }

    async fn send_enter(&self) -> Result<(), SessionError> {
        self.record_send(SentItem::Enter)
    }

    async fn send_key(&self, key: &str) -> Result<(), SessionError> {
        self.record_send(SentItem::Key(key.to_string()))
    }

    async fn send_ctrl_c(&self) -> Result<(), SessionError> {
        self.record_send(SentItem::CtrlC)
    }

    async fn capture_output(
        &self,
        _start_line: Option<i64>,
        _lines: Option<u32>,
    ) -> Result<String, SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        if let Some(frame) = state.captures.pop_front() {
            state.last_capture = frame;
        }
        Ok(state.last_capture.clone())
    }

    async fn capture_scrollback(&self) -> Result<String, SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        if let Some(frame) = state.scrollbacks.pop_front() {
            state.last_scrollback = frame;
        }
        Ok(state.last_scrollback.clone())
    }

    async fn list_clients(&self) -> Result<Vec<String>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        if let Some(frame) = state.client_frames.pop_front() {
            state.current_clients = frame;
        }
        Ok(state.current_clients.clone())
    }

    async fn attach(&self, _read_only: bool) -> Result<(), SessionError> {
        let state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SessionError::NotFound(self.spec.name.clone()));
        }
        Ok(())
    }
}
