//! Per-executable-family controller defaults.
//!
//! The supported assistant CLIs differ in how they signal readiness, how
//! they accept a submit keystroke, and how long their input buffers take to
//! settle. Those differences are data, not subclasses: each family has a
//! preset constructor here, and configuration overrides merge on top.

use std::path::PathBuf;
use std::time::Duration;

use crate::health::HealthConfig;
use crate::restart::RestartConfig;

/// Resolved runtime tunables for one agent controller.
#[derive(Debug, Clone)]
pub struct AgentTunables {
    /// Executable launched inside the session.
    pub executable: String,
    /// Arguments appended after the executable.
    pub executable_args: Vec<String>,
    /// Working directory override; the repository root when absent.
    pub working_dir: Option<PathBuf>,
    /// Bound for `wait_for_startup`.
    pub startup_timeout: Duration,
    /// Default bound for `wait_for_ready`.
    pub response_timeout: Duration,
    /// Poll interval for readiness checks.
    pub ready_check_interval: Duration,
    /// Consecutive equal captures required before the pane counts stable.
    pub ready_stable_checks: u32,
    /// Substrings signalling the assistant accepts new input.
    pub ready_indicators: Vec<String>,
    /// Substrings signalling the assistant is still processing.
    pub loading_indicators: Vec<String>,
    /// Required quiet period after the loading indicator clears.
    pub loading_indicator_settle_time: Duration,
    /// Substrings that must all appear near the pane bottom once a
    /// response is fully emitted.
    pub response_complete_markers: Vec<String>,
    /// Named key used to submit input.
    pub submit_key: String,
    /// Keys tried in order when the primary submit does not take.
    pub submit_fallback_keys: Vec<String>,
    /// Wait before concluding the primary submit did not take.
    pub submit_retry_delay: Duration,
    /// Pause between injecting text and pressing submit.
    pub text_enter_delay: Duration,
    /// Pause after injecting text chunks.
    pub post_text_delay: Duration,
    /// Settling time after startup before the input buffer is trusted.
    pub ready_stabilization_delay: Duration,
    /// Strip ANSI escapes before matching indicators.
    pub strip_ansi_for_indicators: bool,
    /// Wait after spawning before touching the session.
    pub init_wait: Duration,
    /// Pause automation while external clients are attached.
    pub pause_on_manual_clients: bool,
    pub pane_width: Option<u16>,
    pub pane_height: Option<u16>,
    pub health: HealthConfig,
    pub restart: RestartConfig,
}

impl AgentTunables {
    /// Conservative defaults shared by every interactive assistant.
    pub fn base(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            executable_args: Vec::new(),
            working_dir: None,
            startup_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            ready_check_interval: Duration::from_millis(500),
            ready_stable_checks: 3,
            ready_indicators: Vec::new(),
            loading_indicators: Vec::new(),
            loading_indicator_settle_time: Duration::from_secs(1),
            response_complete_markers: Vec::new(),
            submit_key: "Enter".to_string(),
            submit_fallback_keys: Vec::new(),
            submit_retry_delay: Duration::from_secs(1),
            text_enter_delay: Duration::from_millis(100),
            post_text_delay: Duration::from_millis(200),
            ready_stabilization_delay: Duration::from_secs(1),
            strip_ansi_for_indicators: true,
            init_wait: Duration::from_secs(3),
            pause_on_manual_clients: true,
            pane_width: None,
            pane_height: None,
            health: HealthConfig::default(),
            restart: RestartConfig::default(),
        }
    }

    /// Claude Code: boxed prompt UI with a shortcut footer when idle.
    pub fn claude() -> Self {
        let mut t = Self::base("claude");
        t.ready_indicators = vec!["? for shortcuts".to_string(), "────────".to_string()];
        t.loading_indicators = vec!["esc to interrupt".to_string()];
        t
    }

    /// Gemini CLI: slower startup, cancellable spinner while working.
    pub fn gemini() -> Self {
        let mut t = Self::base("gemini");
        t.ready_indicators = vec!["Type your message".to_string()];
        t.loading_indicators = vec!["(esc to cancel".to_string()];
        t.ready_stabilization_delay = Duration::from_secs(2);
        t
    }

    /// Codex CLI.
    pub fn codex() -> Self {
        let mut t = Self::base("codex");
        t.ready_indicators = vec!["▌".to_string()];
        t.loading_indicators = vec!["Working".to_string()];
        t
    }

    /// Qwen CLI: C-m submission with the double-submit fallback chain,
    /// needed for normalized multi-line commands.
    pub fn qwen() -> Self {
        let mut t = Self::base("qwen");
        t.submit_key = "C-m".to_string();
        t.submit_fallback_keys = vec![
            "M-Enter".to_string(),
            "C-m".to_string(),
            "Enter".to_string(),
            "C-j".to_string(),
        ];
        t.submit_retry_delay = Duration::from_millis(200);
        t.text_enter_delay = Duration::from_millis(600);
        t.post_text_delay = Duration::ZERO;
        t.loading_indicators = vec!["(esc to cancel".to_string()];
        t.ready_stabilization_delay = Duration::from_secs(2);
        t
    }

    /// Stub profile for tests and dry runs: no indicators, no delays.
    pub fn stub() -> Self {
        let mut t = Self::base("stub");
        t.startup_timeout = Duration::from_secs(5);
        t.response_timeout = Duration::from_secs(5);
        t.ready_check_interval = Duration::ZERO;
        t.loading_indicator_settle_time = Duration::ZERO;
        t.submit_retry_delay = Duration::ZERO;
        t.text_enter_delay = Duration::ZERO;
        t.post_text_delay = Duration::ZERO;
        t.ready_stabilization_delay = Duration::ZERO;
        t.init_wait = Duration::ZERO;
        t
    }

    /// Pick the preset for an executable, matching on its basename.
    pub fn for_executable(executable: &str) -> Self {
        let basename = executable
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(executable)
            .to_lowercase();
        match basename.as_str() {
            name if name.starts_with("claude") => Self::claude(),
            name if name.starts_with("gemini") => Self::gemini(),
            name if name.starts_with("codex") => Self::codex(),
            name if name.starts_with("qwen") => Self::qwen(),
            name if name.starts_with("stub") => Self::stub(),
            _ => Self::base(executable),
        }
    }

    /// Whether this profile drives a scripted stand-in rather than a real
    /// assistant. Stub profiles skip the stabilization clamp.
    pub fn is_stub(&self) -> bool {
        self.executable == "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_selection_by_basename() {
        assert_eq!(AgentTunables::for_executable("claude").executable, "claude");
        assert_eq!(
            AgentTunables::for_executable("/usr/local/bin/qwen").submit_key,
            "C-m"
        );
        assert_eq!(
            AgentTunables::for_executable("gemini").ready_stabilization_delay,
            Duration::from_secs(2)
        );
        assert_eq!(
            AgentTunables::for_executable("some-other-tool").executable,
            "some-other-tool"
        );
    }

    #[test]
    fn test_qwen_fallback_chain() {
        let t = AgentTunables::qwen();
        assert_eq!(t.submit_fallback_keys, vec!["M-Enter", "C-m", "Enter", "C-j"]);
        assert_eq!(t.post_text_delay, Duration::ZERO);
    }

    #[test]
    fn test_stub_has_no_delays() {
        let t = AgentTunables::stub();
        assert!(t.is_stub());
        assert_eq!(t.init_wait, Duration::ZERO);
        assert_eq!(t.ready_stabilization_delay, Duration::ZERO);
        assert!(t.ready_indicators.is_empty());
    }
}
