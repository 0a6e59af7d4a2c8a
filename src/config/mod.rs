//! Typed configuration with per-agent override merging.
//!
//! Configuration is an explicit struct passed into constructors, never a
//! process-wide singleton. Resolution for one agent layers three sources,
//! later ones winning: the executable-family profile defaults, the global
//! `defaults` section, and the agent's own section.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::profiles::AgentTunables;
use crate::error::CoreError;
use crate::restart::RestartPolicy;

/// Minimum stabilization delay enforced for real (non-stub) assistants.
const MIN_STABILIZATION: Duration = Duration::from_secs(1);

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// One configuration section of optional overrides.
///
/// Every field is optional; absent fields fall through to the next layer.
/// Durations are expressed in (possibly fractional) seconds, matching the
/// YAML the drivers consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentOverrides {
    pub executable: Option<String>,
    pub executable_args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub session: Option<String>,
    pub startup_timeout: Option<f64>,
    pub response_timeout: Option<f64>,
    pub ready_check_interval: Option<f64>,
    pub ready_stable_checks: Option<u32>,
    pub ready_indicators: Option<Vec<String>>,
    pub loading_indicators: Option<Vec<String>>,
    pub loading_indicator_settle_time: Option<f64>,
    pub response_complete_markers: Option<Vec<String>>,
    pub submit_key: Option<String>,
    pub submit_fallback_keys: Option<Vec<String>>,
    pub submit_retry_delay: Option<f64>,
    pub text_enter_delay: Option<f64>,
    pub post_text_delay: Option<f64>,
    pub ready_stabilization_delay: Option<f64>,
    pub strip_ansi_for_indicators: Option<bool>,
    pub init_wait: Option<f64>,
    pub pause_on_manual_clients: Option<bool>,
    pub pane_width: Option<u16>,
    pub pane_height: Option<u16>,

    // Health
    pub health_check_interval: Option<f64>,
    pub health_check_timeout: Option<f64>,
    pub max_failed_health_checks: Option<u32>,
    pub min_health_output_length: Option<usize>,

    // Restart
    pub restart_policy: Option<RestartPolicy>,
    pub max_restart_attempts: Option<u32>,
    pub restart_window: Option<f64>,
    pub restart_initial_backoff: Option<f64>,
    pub restart_max_backoff: Option<f64>,
    pub restart_backoff_factor: Option<f64>,
}

impl AgentOverrides {
    /// Apply every present field onto `tunables`.
    pub fn apply(&self, tunables: &mut AgentTunables) {
        if let Some(value) = &self.executable {
            tunables.executable = value.clone();
        }
        if let Some(value) = &self.executable_args {
            tunables.executable_args = value.clone();
        }
        if let Some(value) = &self.working_dir {
            tunables.working_dir = Some(value.clone());
        }
        if let Some(value) = self.startup_timeout {
            tunables.startup_timeout = secs(value);
        }
        if let Some(value) = self.response_timeout {
            tunables.response_timeout = secs(value);
        }
        if let Some(value) = self.ready_check_interval {
            tunables.ready_check_interval = secs(value);
        }
        if let Some(value) = self.ready_stable_checks {
            tunables.ready_stable_checks = value;
        }
        if let Some(value) = &self.ready_indicators {
            tunables.ready_indicators = value.clone();
        }
        if let Some(value) = &self.loading_indicators {
            tunables.loading_indicators = value.clone();
        }
        if let Some(value) = self.loading_indicator_settle_time {
            tunables.loading_indicator_settle_time = secs(value);
        }
        if let Some(value) = &self.response_complete_markers {
            tunables.response_complete_markers = value.clone();
        }
        if let Some(value) = &self.submit_key {
            tunables.submit_key = value.clone();
        }
        if let Some(value) = &self.submit_fallback_keys {
            tunables.submit_fallback_keys = value.clone();
        }
        if let Some(value) = self.submit_retry_delay {
            tunables.submit_retry_delay = secs(value);
        }
        if let Some(value) = self.text_enter_delay {
            tunables.text_enter_delay = secs(value);
        }
        if let Some(value) = self.post_text_delay {
            tunables.post_text_delay = secs(value);
        }
        if let Some(value) = self.ready_stabilization_delay {
            tunables.ready_stabilization_delay = secs(value);
        }
        if let Some(value) = self.strip_ansi_for_indicators {
            tunables.strip_ansi_for_indicators = value;
        }
        if let Some(value) = self.init_wait {
            tunables.init_wait = secs(value);
        }
        if let Some(value) = self.pause_on_manual_clients {
            tunables.pause_on_manual_clients = value;
        }
        if let Some(value) = self.pane_width {
            tunables.pane_width = Some(value);
        }
        if let Some(value) = self.pane_height {
            tunables.pane_height = Some(value);
        }

        if let Some(value) = self.health_check_interval {
            tunables.health.check_interval = secs(value);
        }
        if let Some(value) = self.health_check_timeout {
            tunables.health.response_timeout = secs(value);
        }
        if let Some(value) = self.max_failed_health_checks {
            tunables.health.max_failed_checks = value;
        }
        if let Some(value) = self.min_health_output_length {
            tunables.health.min_output_length = value;
        }

        if let Some(value) = self.restart_policy {
            tunables.restart.policy = value;
        }
        if let Some(value) = self.max_restart_attempts {
            tunables.restart.max_attempts = value;
        }
        if let Some(value) = self.restart_window {
            tunables.restart.window = secs(value);
        }
        if let Some(value) = self.restart_initial_backoff {
            tunables.restart.initial_backoff = secs(value);
        }
        if let Some(value) = self.restart_max_backoff {
            tunables.restart.max_backoff = secs(value);
        }
        if let Some(value) = self.restart_backoff_factor {
            tunables.restart.backoff_factor = value;
        }
    }
}

/// Multiplexer-level settings shared by every agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    /// Tail bound for scrollback deltas captured per turn.
    pub capture_lines: usize,
    /// Prefix prepended to generated session names.
    pub session_prefix: String,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            capture_lines: 500,
            session_prefix: String::new(),
        }
    }
}

/// Logging sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (overridable via `RUST_LOG`).
    pub level: String,
    /// Optional log file path.
    pub file: Option<PathBuf>,
    /// Mirror logs to the console.
    pub console: bool,
    /// Rotate the log file once it exceeds this size.
    pub max_bytes: u64,
    /// Rotated files kept around.
    pub backup_count: u32,
    /// Output format: "full" or "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            console: true,
            max_bytes: 10 * 1024 * 1024,
            backup_count: 3,
            format: "full".to_string(),
        }
    }
}

/// Complete orchestration configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraConfig {
    /// Global defaults applied to every agent.
    pub defaults: AgentOverrides,
    /// Per-agent sections, merged over the defaults.
    pub agents: HashMap<String, AgentOverrides>,
    pub tmux: MuxSettings,
    pub logging: LoggingConfig,
}

impl OrchestraConfig {
    /// Load from a YAML (or other supported) file, layered with
    /// `MUXCREW_`-prefixed environment overrides.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(
                config::Environment::with_prefix("MUXCREW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| CoreError::Config(err.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|err| CoreError::Config(err.to_string()))
    }

    /// Resolve the runtime tunables for `agent`.
    ///
    /// The executable is taken from the agent section, then the defaults
    /// section, then the agent name itself; the matching family profile
    /// seeds the remaining fields.
    pub fn resolve(&self, agent: &str) -> AgentTunables {
        let section = self.agents.get(agent);
        let executable = section
            .and_then(|s| s.executable.clone())
            .or_else(|| self.defaults.executable.clone())
            .unwrap_or_else(|| agent.to_string());

        let mut tunables = AgentTunables::for_executable(&executable);
        tunables.executable = executable;
        self.defaults.apply(&mut tunables);
        if let Some(section) = section {
            section.apply(&mut tunables);
        }

        // Real assistants need at least a second for the input buffer to
        // settle after startup, whatever the config says.
        if !tunables.is_stub() && tunables.ready_stabilization_delay < MIN_STABILIZATION {
            tunables.ready_stabilization_delay = MIN_STABILIZATION;
        }

        tunables
    }

    /// Session name for `agent`: the configured name, or
    /// `<prefix><agent>`.
    pub fn session_name(&self, agent: &str) -> String {
        self.agents
            .get(agent)
            .and_then(|s| s.session.clone())
            .unwrap_or_else(|| format!("{}{}", self.tmux.session_prefix, agent))
    }

    /// Executable plus argument vector for `agent`.
    pub fn executable_parts(&self, agent: &str) -> Vec<String> {
        let tunables = self.resolve(agent);
        let mut parts = vec![tunables.executable];
        parts.extend(tunables.executable_args);
        parts
    }
}
